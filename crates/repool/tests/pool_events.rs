//! Threshold events fire on upward crossings only, and validation
//! failures are reported exactly once per discarded item.

mod support;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use repool::{Pool, PoolEvent, PoolParameters};
use support::CountingFactory;

struct Recorder(Mutex<Vec<PoolEvent>>);

impl Recorder {
    fn subscribe(pool: &Arc<Pool<CountingFactory>>) -> Arc<Self> {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let recorder_c = Arc::clone(&recorder);
        pool.add_listener(Arc::new(move |_: &str, e: PoolEvent| {
            recorder_c.0.lock().push(e);
        }));
        recorder
    }

    fn count(&self, event: PoolEvent) -> usize {
        self.0.lock().iter().filter(|e| **e == event).count()
    }
}

fn params(pool_size: usize, max_size: usize) -> PoolParameters {
    PoolParameters {
        pool_size,
        max_size,
        expiry: Duration::ZERO,
    }
}

#[test]
fn soft_cap_events_fire_once_per_crossing() {
    let pool = Pool::new("edges", CountingFactory::default(), params(2, 4));
    let recorder = Recorder::subscribe(&pool);

    let a = pool.check_out().unwrap().unwrap();
    let b = pool.check_out().unwrap().unwrap(); // total 2 == pool_size
    assert_eq!(recorder.count(PoolEvent::MaxPoolLimitReached), 1);

    // Hovering at the limit does not re-fire: return and re-borrow.
    pool.check_in(&b).unwrap();
    let b2 = pool.check_out().unwrap().unwrap();
    assert_eq!(recorder.count(PoolEvent::MaxPoolLimitReached), 1);

    let c = pool.check_out().unwrap().unwrap(); // total 3 == pool_size + 1
    assert_eq!(recorder.count(PoolEvent::MaxPoolLimitExceeded), 1);

    let _d = pool.check_out().unwrap().unwrap(); // total 4 == max_size
    assert_eq!(recorder.count(PoolEvent::MaxSizeLimitReached), 1);

    assert_eq!(recorder.count(PoolEvent::CheckOut), 5);
    assert_eq!(recorder.count(PoolEvent::CheckIn), 1);

    drop((a, b2, c));
}

#[test]
fn hard_cap_error_fires_per_refused_checkout() {
    let pool = Pool::new("refuse", CountingFactory::default(), params(1, 1));
    let recorder = Recorder::subscribe(&pool);

    let _a = pool.check_out().unwrap().unwrap();
    assert!(pool.check_out().unwrap().is_none());
    assert!(pool.check_out().unwrap().is_none());
    assert_eq!(recorder.count(PoolEvent::MaxSizeLimitError), 2);
}

#[test]
fn validation_error_fires_once_per_transition() {
    let factory = CountingFactory::default();
    let pool = Pool::new("validate", factory, params(2, 0));
    let recorder = Recorder::subscribe(&pool);

    // Install a validator failure on the item's third check-out.
    let a = pool.check_out().unwrap().unwrap();
    pool.check_in(&a).unwrap();
    let b = pool.check_out().unwrap().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    pool.check_in(&b).unwrap();

    pool.factory().mark_invalid(a.id);
    let c = pool.check_out().unwrap().unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(recorder.count(PoolEvent::ValidationError), 1);

    // Subsequent borrow/return cycles use the fresh item only.
    pool.check_in(&c).unwrap();
    let d = pool.check_out().unwrap().unwrap();
    assert!(Arc::ptr_eq(&c, &d));
    assert_eq!(recorder.count(PoolEvent::ValidationError), 1);
}

#[test]
fn parameters_changed_event_fires() {
    let pool = Pool::new("params", CountingFactory::default(), params(1, 0));
    let recorder = Recorder::subscribe(&pool);
    pool.set_parameters(params(2, 0));
    assert_eq!(recorder.count(PoolEvent::ParametersChanged), 1);
}
