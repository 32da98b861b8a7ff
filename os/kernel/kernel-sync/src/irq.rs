//! Interrupt masking and the interrupt-safe spin lock.
//!
//! On bare-metal x86-64 the helpers issue `cli`/`sti` and read `RFLAGS.IF`.
//! Hosted builds (unit tests) have no interrupt flag to manipulate, so the
//! helpers are no-ops there and report interrupts as disabled.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// `true` if maskable interrupts are enabled on this core (`RFLAGS.IF`).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::rflags() & (1 << 9) != 0
}

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[inline]
pub fn disable_interrupts() {
    arch::cli();
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[inline]
pub fn enable_interrupts() {
    arch::sti();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    #[inline]
    pub fn cli() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn sti() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
        r
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn cli() {}

    #[inline]
    pub const fn sti() {}

    #[inline]
    pub const fn rflags() -> u64 {
        0
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, so guards nest.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}

/// A [`SpinLock`] whose guard also keeps interrupts disabled on the
/// acquiring core.
///
/// Interrupts are masked *before* spinning, so a handler can never interrupt
/// the holder and then spin on the same lock.
///
/// ```
/// use kernel_sync::IrqSpinLock;
///
/// static COUNTER: IrqSpinLock<u64> = IrqSpinLock::new(0);
/// *COUNTER.lock() += 1;
/// assert_eq!(*COUNTER.lock(), 1);
/// ```
#[derive(Debug, Default)]
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: SpinLock::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        IrqSpinLockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = IrqGuard::new();
        // On failure `irq` drops here and restores the interrupt state.
        self.inner.try_lock().map(|guard| IrqSpinLockGuard { guard, _irq: irq })
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// Guard of an [`IrqSpinLock`].
///
/// Field order matters: the lock is released before interrupts are restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
