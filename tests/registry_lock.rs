// Registry lock safety and liveness under randomised contention.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tunercard::api::{Registry, RegistryOptions, StaticEnumerator};

const NAME: &str = "lock-test";

fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    getrandom::fill(&mut buf).expect("random bytes");
    u32::from_le_bytes(buf)
}

fn open(dir: &std::path::Path) -> Registry {
    Registry::open(
        RegistryOptions::new(NAME).with_dir(dir).with_user_size(8),
        StaticEnumerator::default(),
    )
    .expect("registry")
}

#[test]
fn contended_lock_is_mutually_exclusive_and_live() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workers = 6;
    let rounds = 40;
    let inside = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let dir = temp.path();
            let inside = &inside;
            scope.spawn(move || {
                // One mapping per worker, like separate processes would have.
                let registry = open(dir);
                for _ in 0..rounds {
                    let mut guard = registry.lock();
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");

                    let data = guard.user_data_mut(0).expect("payload");
                    let mut counter = [0u8; 4];
                    counter.copy_from_slice(&data[..4]);
                    let next = u32::from_le_bytes(counter) + 1;
                    std::thread::sleep(Duration::from_micros(u64::from(random_u32() % 300)));
                    data[..4].copy_from_slice(&next.to_le_bytes());

                    inside.store(false, Ordering::SeqCst);
                    drop(guard);
                    if random_u32() % 2 == 0 {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });

    let registry = open(temp.path());
    let data = registry.user_data(0).expect("payload");
    let total = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    assert_eq!(total, workers * rounds);
}

#[test]
fn waiter_wakes_when_holder_releases() {
    let temp = tempfile::tempdir().expect("tempdir");
    let holder = open(temp.path());
    let waiter = open(temp.path());
    let released = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let guard = holder.lock();
        let handle = scope.spawn(|| {
            let _guard = waiter.lock();
            assert!(released.load(Ordering::SeqCst), "lock granted while held");
        });
        std::thread::sleep(Duration::from_millis(50));
        released.store(true, Ordering::SeqCst);
        drop(guard);
        handle.join().expect("waiter");
    });

    // Both permits are back: a fresh lock succeeds immediately.
    drop(holder.lock());
}
