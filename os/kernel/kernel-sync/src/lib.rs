//! # Kernel synchronization primitives
//!
//! Spin locks for the memory-management core. Every critical section is
//! short and never suspends; contention is resolved by spinning.
//!
//! * [`SpinLock`]: test-and-test-and-set lock for data that is never touched
//!   from interrupt context (per-address-space state).
//! * [`IrqSpinLock`]: the same lock, additionally disabling interrupts on the
//!   acquiring core for the guard's lifetime (frame allocator, heaps), so an
//!   interrupt handler that allocates cannot deadlock against its own core.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
