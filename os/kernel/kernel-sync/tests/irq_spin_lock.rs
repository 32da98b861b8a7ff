use kernel_sync::irq::interrupts_enabled;
use kernel_sync::{IrqGuard, IrqSpinLock};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guards_nest_without_reenabling() {
    let outer = IrqGuard::new();
    let inner = IrqGuard::new();
    // The inner guard saw interrupts already masked, so it must not restore them.
    assert!(!inner.restores_interrupts());
    drop(inner);
    drop(outer);
    assert!(!interrupts_enabled());
}

#[test]
fn irq_lock_serializes_access() {
    let threads = 4;
    let iters = 2_000;
    let lock = Arc::new(IrqSpinLock::new(0u64));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    *lock.lock() += 1;
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(*lock.lock(), (threads * iters) as u64);
}

#[test]
fn try_lock_fails_while_held() {
    let lock = IrqSpinLock::new([0u8; 4]);
    let mut g = lock.lock();
    g[0] = 7;
    assert!(lock.try_lock().is_none());
    drop(g);
    assert_eq!(lock.try_lock().map(|g| g[0]), Some(7));
}

#[test]
fn with_lock_and_into_inner() {
    let mut lock = IrqSpinLock::new(String::from("frame"));
    lock.with_lock(|s| s.push('s'));
    lock.get_mut().push('!');
    assert_eq!(lock.into_inner(), "frames!");
}
