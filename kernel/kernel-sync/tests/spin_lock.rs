use kernel_sync::SpinLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;

#[test]
fn guard_mutates_and_unlocks_on_drop() {
    let counter = SpinLock::new(0u32);

    *counter.lock() += 5;
    *counter.lock() += 5;

    // a third lock still succeeds and sees both writes
    assert_eq!(*counter.lock(), 10);
}

#[test]
fn try_lock_reflects_the_guard_lifetime() {
    let lock = SpinLock::new(());

    let held = lock.try_lock().expect("uncontended");
    assert!(lock.try_lock().is_none());
    drop(held);
    assert!(lock.try_lock().is_some());
}

#[test]
fn try_lock_observed_from_another_thread() {
    let lock = Arc::new(SpinLock::new(0u8));
    let guard = lock.lock();

    let (tx, rx) = mpsc::channel();
    let remote = Arc::clone(&lock);
    let probe = thread::spawn(move || {
        tx.send(remote.try_lock().is_none()).unwrap();
        // block until the main thread released the guard
        *remote.lock() = 7;
    });

    assert!(rx.recv().unwrap(), "other thread must see the lock as held");
    drop(guard);
    probe.join().unwrap();
    assert_eq!(*lock.lock(), 7);
}

#[test]
fn with_lock_passes_the_value_through() {
    let names = SpinLock::new(vec!["pmem", "vmem"]);

    let count = names.with_lock(|v| {
        v.push("heap");
        v.len()
    });
    assert_eq!(count, 3);
    assert_eq!(names.with_lock(|v| v.join(",")), "pmem,vmem,heap");
}

#[test]
fn get_mut_needs_no_locking() {
    let mut lock = SpinLock::new([0u8; 4]);
    lock.get_mut()[2] = 9;
    assert_eq!(lock.lock()[2], 9);
}

#[test]
fn panicking_critical_section_leaves_the_lock_free() {
    let lock = SpinLock::new(1u32);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let mut guard = lock.lock();
        *guard = 2;
        panic!("unwound mid-section");
    }));
    assert!(result.is_err());

    // the guard's drop ran during unwinding; the write stuck
    assert_eq!(*lock.lock(), 2);
}

#[test]
fn contended_counter_loses_no_increment() {
    const WRITERS: usize = 4;
    const ROUNDS: usize = 10_000;

    let total = Arc::new(SpinLock::new(0usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Barrier::new(WRITERS));

    let workers: Vec<_> = (0..WRITERS)
        .map(|_| {
            let total = Arc::clone(&total);
            let inside = Arc::clone(&inside);
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait();
                for _ in 0..ROUNDS {
                    let mut guard = total.lock();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0, "two writers inside");
                    *guard += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*total.lock(), WRITERS * ROUNDS);
}

#[test]
fn sync_bound_follows_the_payload() {
    fn assert_sync<T: Sync>(_: &T) {}
    let lock = SpinLock::new(String::new());
    assert_sync(&lock);
}
