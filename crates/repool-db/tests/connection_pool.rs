//! Connection-pool behaviour: credential paths, validation, session
//! double-close, teardown aggregation and forcible release.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use repool::{PoolEvent, PoolParameters};
use repool_db::testing;
use repool_db::{
    AutoCommitValidator, CachingConnection, ConnectionPool, ConnectionValidator, DbError,
    RotDecoder,
};

fn params(pool_size: usize, max_size: usize) -> PoolParameters {
    PoolParameters {
        pool_size,
        max_size,
        expiry: Duration::ZERO,
    }
}

#[test]
fn lifo_reuse_and_hit_rate() {
    testing::memory_driver();
    let pool = ConnectionPool::with_url("reuse", params(1, 0), "memory:reuse");

    let first = pool.connection().unwrap().unwrap();
    let first_session = first.session();
    first.close().unwrap();

    let second = pool.connection().unwrap().unwrap();
    assert!(Arc::ptr_eq(&first_session, &second.session()));
    assert!((pool.hit_rate() - 50.0).abs() < f64::EPSILON);
}

#[test]
fn properties_path_decodes_password_into_a_copy() {
    let driver = testing::memory_driver();
    let mut properties = BTreeMap::new();
    properties.insert("user".to_owned(), "scott".to_owned());
    properties.insert("password".to_owned(), "gvtre".to_owned());
    properties.insert("ssl".to_owned(), "required".to_owned());
    let pool = ConnectionPool::with_properties(
        "props",
        params(1, 0),
        "memory:props",
        properties,
    );
    pool.set_password_decoder(Some(Arc::new(RotDecoder)));

    let conn = pool.connection().unwrap().unwrap();
    drop(conn);

    let state = driver.state("memory:props");
    assert_eq!(
        state.connect_users.lock().as_slice(),
        [Some("scott".to_owned())]
    );
    assert_eq!(
        state.connect_passwords.lock().as_slice(),
        [Some("tiger".to_owned())]
    );
    assert_eq!(
        state.last_properties.lock().get("ssl").map(String::as_str),
        Some("required")
    );
}

#[test]
fn credential_rejection_falls_back_to_url_only() {
    let driver = testing::memory_driver();
    let state = driver.state("memory:fallback");
    state.reject_credentials.store(true, Ordering::SeqCst);

    let pool = ConnectionPool::with_credentials(
        "fallback",
        params(1, 0),
        "memory:fallback",
        "scott",
        "tiger",
    );
    let conn = pool.connection().unwrap().unwrap();
    assert!(!conn.is_closed());

    // Only the URL-only attempt reached the database.
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
    assert_eq!(state.connect_users.lock().as_slice(), [None]);
}

#[test]
fn create_failure_surfaces_the_driver_error() {
    let driver = testing::memory_driver();
    driver
        .state("memory:down")
        .fail_connects
        .store(usize::MAX, Ordering::SeqCst);
    let pool = ConnectionPool::with_url("down", params(1, 0), "memory:down");

    let error = pool.connection().unwrap_err();
    let DbError::Pool(pool_error) = &error else {
        panic!("unexpected error: {error:?}");
    };
    // Root cause is reachable through the source chain.
    let source = std::error::Error::source(pool_error).expect("source attached");
    assert!(source.to_string().contains("memory database unavailable"));
}

struct NthFailValidator {
    calls: AtomicUsize,
    fail_at: usize,
}

impl ConnectionValidator for NthFailValidator {
    fn is_valid(&self, _connection: &CachingConnection) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1 != self.fail_at
    }
}

#[test]
fn failed_validation_discards_session_and_emits_event_once() {
    let driver = testing::memory_driver();
    let pool = ConnectionPool::with_url("validate", params(2, 0), "memory:validate");
    pool.set_validator(Some(Arc::new(NthFailValidator {
        calls: AtomicUsize::new(0),
        fail_at: 3,
    })));
    let events: Arc<Mutex<Vec<PoolEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_c = Arc::clone(&events);
    pool.add_listener(Arc::new(move |_: &str, e: PoolEvent| {
        events_c.lock().push(e);
    }));

    for _ in 0..4 {
        let conn = pool.connection().unwrap().unwrap();
        conn.close().unwrap();
    }

    let state = driver.state("memory:validate");
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        events
            .lock()
            .iter()
            .filter(|e| **e == PoolEvent::ValidationError)
            .count(),
        1
    );
}

#[test]
fn default_validator_discards_session_once_driver_reports_it_dead() {
    let driver = testing::memory_driver();
    let state = driver.state("memory:stale");
    state.fail_validation_after.store(2, Ordering::SeqCst);

    let pool = ConnectionPool::with_url("stale", params(2, 0), "memory:stale");
    let events: Arc<Mutex<Vec<PoolEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_c = Arc::clone(&events);
    pool.add_listener(Arc::new(move |_: &str, e: PoolEvent| {
        events_c.lock().push(e);
    }));

    // The session answers two health probes, then the stock validator
    // sees it closed; the pool discards it and opens a replacement.
    for _ in 0..3 {
        let conn = pool.connection().unwrap().unwrap();
        conn.close().unwrap();
    }

    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        events
            .lock()
            .iter()
            .filter(|e| **e == PoolEvent::ValidationError)
            .count(),
        1
    );
}

#[test]
fn auto_commit_validator_accepts_live_sessions() {
    testing::memory_driver();
    let pool = ConnectionPool::with_url("acv", params(1, 0), "memory:acv");
    pool.set_validator(Some(Arc::new(AutoCommitValidator)));

    let conn = pool.connection().unwrap().unwrap();
    conn.close().unwrap();
    let conn = pool.connection().unwrap().unwrap();
    assert!(!conn.is_closed());
    assert!((pool.hit_rate() - 50.0).abs() < f64::EPSILON);
}

#[test]
fn session_double_close_reports_closed() {
    testing::memory_driver();
    let pool = ConnectionPool::with_url("dclose", params(1, 0), "memory:dclose");

    let conn = pool.connection().unwrap().unwrap();
    let session = conn.session();
    conn.close().unwrap();

    assert!(matches!(session.close(), Err(DbError::ConnectionClosed)));
    // Returned to the pool exactly once.
    assert_eq!(pool.free_count(), 1);
    assert_eq!(pool.checked_out(), 0);
}

#[test]
fn session_release_aggregates_failures_and_still_closes_raw() {
    let driver = testing::memory_driver();
    let state = driver.state("memory:agg");
    let pool = ConnectionPool::with_url("agg", params(1, 0), "memory:agg");

    let conn = pool.connection().unwrap().unwrap();
    let _stmt = conn.create_statement().unwrap();
    state.fail_statement_close.store(true, Ordering::SeqCst);

    let session = conn.session();
    let error = session.release().unwrap_err();
    match &error {
        DbError::ReleaseFailed { causes } => assert!(!causes.is_empty()),
        other => panic!("unexpected error: {other:?}"),
    }
    // The raw session was closed despite the statement failure.
    assert_eq!(state.connections_closed.load(Ordering::SeqCst), 1);
    state.fail_statement_close.store(false, Ordering::SeqCst);
}

#[test]
fn forcible_release_tears_down_borrowed_sessions() {
    let driver = testing::memory_driver();
    let state = driver.state("memory:force");
    let pool = ConnectionPool::with_url("force", params(2, 2), "memory:force");

    let held = pool.connection().unwrap().unwrap();
    pool.release_forcibly();

    assert_eq!(pool.size(), 0);
    assert!(pool.is_released());
    assert_eq!(state.connections_closed.load(Ordering::SeqCst), 1);
    assert!(held.is_closed());

    // Dropping the stale guard must not double-free or panic.
    drop(held);
    assert_eq!(state.connections_closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        pool.connection(),
        Err(DbError::Pool(repool::PoolError::Released { .. }))
    ));
}

#[test]
fn connection_timeout_returns_none_when_exhausted() {
    testing::memory_driver();
    let pool = ConnectionPool::with_url("busy", params(1, 1), "memory:busy");
    let _held = pool.connection().unwrap().unwrap();

    let waited = pool
        .connection_timeout(Duration::from_millis(80))
        .unwrap();
    assert!(waited.is_none());
}
