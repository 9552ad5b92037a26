//! Idle entries are reaped once their expiry deadline passes.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use repool::{Pool, PoolParameters};
use support::CountingFactory;

#[test]
fn idle_entries_are_reaped() {
    let factory = CountingFactory::default();
    let destroyed = Arc::clone(&factory.destroyed);
    let pool = Pool::new(
        "expiry",
        factory,
        PoolParameters {
            pool_size: 4,
            max_size: 0,
            expiry: Duration::from_millis(200),
        },
    );

    pool.init(4);
    let deadline = Instant::now() + Duration::from_secs(2);
    while pool.free_count() < 4 {
        assert!(Instant::now() < deadline, "initialiser never filled the pool");
        std::thread::sleep(Duration::from_millis(10));
    }

    // No traffic for well over 2 * expiry + reaper interval.
    std::thread::sleep(Duration::from_secs(1));

    assert_eq!(pool.free_count(), 0);
    assert_eq!(destroyed.load(Ordering::SeqCst), 4);
}

#[test]
fn entries_survive_when_expiry_disabled() {
    let pool = Pool::new(
        "no-expiry",
        CountingFactory::default(),
        PoolParameters {
            pool_size: 2,
            max_size: 0,
            expiry: Duration::ZERO,
        },
    );
    let a = pool.check_out().unwrap().unwrap();
    pool.check_in(&a).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(pool.free_count(), 1);
}

#[test]
fn parameter_change_restamps_existing_entries() {
    let factory = CountingFactory::default();
    let destroyed = Arc::clone(&factory.destroyed);
    let pool = Pool::new(
        "restamp",
        factory,
        PoolParameters {
            pool_size: 2,
            max_size: 0,
            expiry: Duration::ZERO,
        },
    );
    let a = pool.check_out().unwrap().unwrap();
    pool.check_in(&a).unwrap();

    // Enabling expiry must apply to the entry already in the pool.
    pool.set_parameters(PoolParameters {
        pool_size: 2,
        max_size: 0,
        expiry: Duration::from_millis(100),
    });
    let deadline = Instant::now() + Duration::from_secs(2);
    while pool.free_count() > 0 {
        assert!(Instant::now() < deadline, "entry was never reaped");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}
