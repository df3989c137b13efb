//! Spinlock mutual exclusion and interrupt-mask handling.
//!
//! The host interrupt flag is process-wide, so every test takes `SERIAL`
//! before touching it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use kcore_kernel::arch::interrupts;
use kcore_kernel::sync::spinlock::SpinLock;

static SERIAL: Mutex<()> = Mutex::new(());

fn serialize() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn test_guard_masks_and_restores_interrupts() {
    let _serial = serialize();
    let lock = SpinLock::new(0u32);

    interrupts::enable();
    {
        let mut guard = lock.lock();
        assert!(!interrupts::are_enabled());
        *guard += 1;
    }
    assert!(interrupts::are_enabled());

    interrupts::disable();
    {
        let _guard = lock.lock();
        assert!(!interrupts::are_enabled());
    }
    assert!(!interrupts::are_enabled());
    assert_eq!(lock.into_inner(), 1);
}

#[test]
fn test_nested_guards_restore_in_reverse_order() {
    let _serial = serialize();
    let outer = SpinLock::new(());
    let inner = SpinLock::new(());

    interrupts::enable();
    let outer_guard = outer.lock();
    let inner_guard = inner.lock();
    drop(inner_guard);
    assert!(!interrupts::are_enabled());
    drop(outer_guard);
    assert!(interrupts::are_enabled());
    interrupts::disable();
}

#[test]
fn test_try_lock_fails_while_held() {
    let _serial = serialize();
    let lock = SpinLock::new(5u8);

    interrupts::enable();
    let guard = lock.lock();
    assert!(lock.is_locked());
    assert!(lock.try_lock().is_none());
    assert!(!interrupts::are_enabled());
    drop(guard);
    assert!(interrupts::are_enabled());

    {
        let guard = lock.try_lock().expect("lock is free");
        assert_eq!(*guard, 5);
        assert!(!interrupts::are_enabled());
    }
    assert!(interrupts::are_enabled());
    assert!(!lock.is_locked());
    interrupts::disable();
}

#[test]
fn test_without_interrupts_restores_state() {
    let _serial = serialize();
    interrupts::enable();
    let seen = interrupts::without_interrupts(interrupts::are_enabled);
    assert!(!seen);
    assert!(interrupts::are_enabled());
    interrupts::disable();
}

#[test]
fn test_threads_are_serialized() {
    let _serial = serialize();
    let counter = Arc::new(SpinLock::new(0u64));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for _ in 0..1000 {
                    let mut guard = counter.lock();
                    let value = *guard;
                    thread::yield_now();
                    *guard = value + 1;
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*counter.lock(), 4000);
    assert!(!interrupts::are_enabled());
}
