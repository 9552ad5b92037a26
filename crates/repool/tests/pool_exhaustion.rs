//! A pool at its hard cap refuses or delays check-outs until an item
//! comes back.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use repool::{Pool, PoolEvent, PoolParameters};
use support::CountingFactory;

fn bounded(pool_size: usize, max_size: usize) -> PoolParameters {
    PoolParameters {
        pool_size,
        max_size,
        expiry: Duration::ZERO,
    }
}

#[test]
fn timed_checkout_returns_none_at_deadline() {
    let pool = Pool::new("exhaust", CountingFactory::default(), bounded(2, 2));
    let events: Arc<Mutex<Vec<PoolEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_c = Arc::clone(&events);
    pool.add_listener(Arc::new(move |_: &str, e: PoolEvent| {
        events_c.lock().push(e);
    }));

    let _a = pool.check_out().unwrap().unwrap();
    let _b = pool.check_out().unwrap().unwrap();

    let start = Instant::now();
    let c = pool.check_out_timeout(Duration::from_millis(100)).unwrap();
    let waited = start.elapsed();

    assert!(c.is_none());
    assert!(waited >= Duration::from_millis(100));
    assert!(waited < Duration::from_millis(500), "waited {waited:?}");
    assert!(events.lock().contains(&PoolEvent::MaxSizeLimitError));
}

#[test]
fn waiter_is_woken_by_checkin() {
    let pool = Pool::new("wake", CountingFactory::default(), bounded(1, 1));
    let held = pool.check_out().unwrap().unwrap();

    let pool_c = Arc::clone(&pool);
    let waiter = std::thread::spawn(move || {
        pool_c
            .check_out_timeout(Duration::from_secs(5))
            .unwrap()
            .expect("waiter should receive the checked-in item")
    });

    std::thread::sleep(Duration::from_millis(50));
    pool.check_in(&held).unwrap();

    let got = waiter.join().unwrap();
    assert!(Arc::ptr_eq(&got, &held));
}

#[test]
fn capacity_bound_holds_under_load() {
    let pool = Pool::new("bound", CountingFactory::default(), bounded(3, 3));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = Arc::clone(&pool);
        handles.push(std::thread::spawn(move || {
            for _ in 0..25 {
                if let Some(item) = pool
                    .check_out_timeout(Duration::from_millis(200))
                    .unwrap()
                {
                    assert!(pool.size() <= 3);
                    std::thread::sleep(Duration::from_millis(1));
                    pool.check_in(&item).unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(pool.size() <= 3);
    assert_eq!(pool.checked_out(), 0);
}
