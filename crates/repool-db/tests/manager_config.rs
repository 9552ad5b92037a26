//! Pool-manager behaviour: file-backed caching, client reference
//! counts, config tolerance and pool lookup.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use repool_db::testing;
use repool_db::{DbError, PoolManager};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn manager_is_cached_per_file_and_reference_counted() {
    testing::memory_driver();
    let file = write_config(
        r#"
        drivers = ["memory"]

        [pools.primary]
        url = "memory:mgr-primary"
        maxpool = 2
        "#,
    );

    let first = PoolManager::from_file(file.path()).unwrap();
    let second = PoolManager::from_file(file.path()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.client_count(), 2);

    let conn = first.connection("primary").unwrap().unwrap();
    conn.close().unwrap();

    // The first release only drops a client.
    first.release();
    assert!(!first.is_released());
    assert!(second.connection("primary").is_ok());

    // The last release tears the pools down.
    second.release();
    assert!(second.is_released());
    assert!(matches!(
        second.connection("primary"),
        Err(DbError::ManagerReleased)
    ));
    assert!(first.pool("primary").is_err());

    // A fresh load after release builds a new manager.
    let third = PoolManager::from_file(file.path()).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(third.client_count(), 1);
    third.release();
}

#[test]
fn unknown_pool_is_reported() {
    testing::memory_driver();
    let file = write_config(
        r#"
        [pools.only]
        url = "memory:mgr-only"
        "#,
    );
    let manager = PoolManager::from_file(file.path()).unwrap();
    assert!(matches!(
        manager.connection("absent"),
        Err(DbError::UnknownPool { .. })
    ));
    manager.release();
}

#[test]
fn init_prepopulates_the_pool() {
    testing::memory_driver();
    let file = write_config(
        r#"
        [pools.warm]
        url = "memory:mgr-warm"
        maxpool = 3
        init = 2
        "#,
    );
    let manager = PoolManager::from_file(file.path()).unwrap();
    let pool = manager.pool("warm").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while pool.free_count() < 2 {
        assert!(Instant::now() < deadline, "initialiser never ran");
        std::thread::sleep(Duration::from_millis(10));
    }
    manager.release();
}

#[test]
fn invalid_numeric_option_builds_unbounded_pool() {
    testing::memory_driver();
    let file = write_config(
        r#"
        [pools.loose]
        url = "memory:mgr-loose"
        maxpool = "plenty"
        "#,
    );
    let manager = PoolManager::from_file(file.path()).unwrap();
    let pool = manager.pool("loose").unwrap();

    // maxpool fell back to 0 (unbounded): a burst of borrows succeeds.
    let a = pool.connection().unwrap().unwrap();
    let b = pool.connection().unwrap().unwrap();
    let c = pool.connection().unwrap().unwrap();
    drop((a, b, c));
    manager.release();
}

#[test]
fn bad_pool_table_does_not_poison_siblings() {
    testing::memory_driver();
    let file = write_config(
        r#"
        [pools.good]
        url = "memory:mgr-good"

        [pools.broken]
        user = "nobody"
        "#,
    );
    let manager = PoolManager::from_file(file.path()).unwrap();
    assert!(manager.pool("good").is_ok());
    assert!(matches!(
        manager.pool("broken"),
        Err(DbError::UnknownPool { .. })
    ));
    manager.release();
}

#[test]
fn from_config_builds_uncached_manager_with_decoder_and_validator() {
    let driver = testing::memory_driver();
    let config = repool_db::ManagerConfig::parse(
        r#"
        drivers = ["memory"]

        [pools.secure]
        url = "memory:mgr-secure"
        user = "scott"
        password = "gvtre"
        decoder = "rot13"
        validator = "auto-commit"
        maxpool = 1
        "#,
    )
    .unwrap();
    let manager = PoolManager::from_config(config);

    let conn = manager.connection("secure").unwrap().unwrap();
    drop(conn);

    let state = driver.state("memory:mgr-secure");
    assert_eq!(
        state.connect_passwords.lock().as_slice(),
        [Some("tiger".to_owned())]
    );
    manager.release();
}
