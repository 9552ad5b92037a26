//! In-memory driver for tests and smoke runs.
//!
//! Recognises `memory:` URLs. Each distinct URL gets its own shared
//! [`MemoryState`] with lifecycle counters and scriptable failure
//! modes, so concurrent tests stay isolated by using distinct URLs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::driver::{
    self, ConnectOptions, Driver, KeyedRequest, RawCallableStatement, RawConnection,
    RawPreparedStatement, RawStatement, Row, Value,
};
use crate::error::{DbError, Result};
use crate::mode::StatementMode;

/// Shared, observable state behind one `memory:` URL.
#[derive(Default)]
pub struct MemoryState {
    /// Successful connects.
    pub connects: AtomicUsize,
    /// Connects left to fail before succeeding again.
    pub fail_connects: AtomicUsize,
    /// Raw sessions closed.
    pub connections_closed: AtomicUsize,
    /// Raw statements created (all families).
    pub statements_created: AtomicUsize,
    /// Raw statements closed.
    pub statements_closed: AtomicUsize,
    /// Rollbacks issued.
    pub rollbacks: AtomicUsize,
    /// When non-zero, each session reports itself dead once it has
    /// answered this many health probes (`is_closed` checks and
    /// `set_auto_commit` round trips). Fresh sessions start with a
    /// fresh budget.
    pub fail_validation_after: AtomicUsize,
    /// Every SQL text executed, in order.
    pub executed: Mutex<Vec<String>>,
    /// SQL containing this substring fails to execute.
    pub poison_sql: Mutex<Option<String>>,
    /// When set, statement recycling (clearing results) fails.
    pub fail_recycle: AtomicBool,
    /// When set, closing raw statements fails.
    pub fail_statement_close: AtomicBool,
    /// Warnings handed to each new session.
    pub seed_warnings: Mutex<Vec<String>>,
    /// The `user` each connect was made with (None for URL-only).
    pub connect_users: Mutex<Vec<Option<String>>>,
    /// The `password` each connect was made with.
    pub connect_passwords: Mutex<Vec<Option<String>>>,
    /// The pass-through properties of the latest connect.
    pub last_properties: Mutex<BTreeMap<String, String>>,
    /// When set, connects with credentials fail but URL-only connects
    /// succeed.
    pub reject_credentials: AtomicBool,
}

/// Driver for `memory:` URLs.
#[derive(Default)]
pub struct MemoryDriver {
    states: DashMap<String, Arc<MemoryState>>,
}

impl MemoryDriver {
    /// The shared state for a URL, created on first use.
    pub fn state(&self, url: &str) -> Arc<MemoryState> {
        self.states
            .entry(url.to_owned())
            .or_default()
            .value()
            .clone()
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn accepts_url(&self, url: &str) -> bool {
        url.starts_with("memory:")
    }

    fn connect(&self, url: &str, options: &ConnectOptions) -> Result<Box<dyn RawConnection>> {
        let state = self.state(url);
        if state
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DbError::driver("memory database unavailable"));
        }
        if state.reject_credentials.load(Ordering::SeqCst)
            && (options.user.is_some() || options.password.is_some())
        {
            return Err(DbError::driver("credentials rejected"));
        }
        state.connects.fetch_add(1, Ordering::SeqCst);
        state.connect_users.lock().push(options.user.clone());
        state
            .connect_passwords
            .lock()
            .push(options.password.as_ref().map(|p| p.expose().to_owned()));
        *state.last_properties.lock() = options.properties.clone();
        let warnings = state.seed_warnings.lock().clone();
        Ok(Box::new(MemoryConnection {
            state,
            closed: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            warnings: Mutex::new(warnings),
        }))
    }
}

/// The process-wide memory driver, registered on first access.
pub fn memory_driver() -> Arc<MemoryDriver> {
    static INSTANCE: Lazy<Arc<MemoryDriver>> = Lazy::new(|| {
        let instance = Arc::new(MemoryDriver::default());
        driver::register_driver(instance.clone());
        instance
    });
    Arc::clone(&INSTANCE)
}

struct MemoryConnection {
    state: Arc<MemoryState>,
    closed: AtomicBool,
    auto_commit: AtomicBool,
    /// Health probes answered so far, counted against the state's
    /// `fail_validation_after` budget.
    probes: AtomicUsize,
    warnings: Mutex<Vec<String>>,
}

impl MemoryConnection {
    /// Answer one health probe; true once the scripted budget is
    /// spent.
    fn probe_failed(&self) -> bool {
        let limit = self.state.fail_validation_after.load(Ordering::SeqCst);
        limit > 0 && self.probes.fetch_add(1, Ordering::SeqCst) + 1 > limit
    }

    fn new_statement(&self, sql: Option<String>, mode: StatementMode) -> MemoryStatement {
        self.state.statements_created.fetch_add(1, Ordering::SeqCst);
        MemoryStatement {
            state: Arc::clone(&self.state),
            sql,
            mode,
            closed: AtomicBool::new(false),
            params: Mutex::new(BTreeMap::new()),
        }
    }
}

impl RawConnection for MemoryConnection {
    fn create_statement(&self, mode: StatementMode) -> Result<Box<dyn RawStatement>> {
        Ok(Box::new(self.new_statement(None, mode)))
    }

    fn prepare_statement(
        &self,
        sql: &str,
        mode: StatementMode,
    ) -> Result<Box<dyn RawPreparedStatement>> {
        Ok(Box::new(self.new_statement(Some(sql.to_owned()), mode)))
    }

    fn prepare_call(
        &self,
        sql: &str,
        mode: StatementMode,
    ) -> Result<Box<dyn RawCallableStatement>> {
        Ok(Box::new(self.new_statement(Some(sql.to_owned()), mode)))
    }

    fn prepare_statement_keyed(
        &self,
        sql: &str,
        _request: KeyedRequest,
    ) -> Result<Box<dyn RawPreparedStatement>> {
        Ok(Box::new(
            self.new_statement(Some(sql.to_owned()), StatementMode::default()),
        ))
    }

    fn auto_commit(&self) -> Result<bool> {
        Ok(self.auto_commit.load(Ordering::SeqCst))
    }

    fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::driver("connection closed"));
        }
        if self.probe_failed() {
            return Err(DbError::driver("connection lost"));
        }
        self.auto_commit.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut *self.warnings.lock())
    }

    fn clear_warnings(&self) -> Result<()> {
        self.warnings.lock().clear();
        Ok(())
    }

    fn clear_type_map(&self) -> Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.probe_failed()
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryStatement {
    state: Arc<MemoryState>,
    sql: Option<String>,
    mode: StatementMode,
    closed: AtomicBool,
    params: Mutex<BTreeMap<usize, Value>>,
}

impl MemoryStatement {
    fn run(&self, sql: &str) -> Result<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::driver("statement closed"));
        }
        if let Some(poison) = &*self.state.poison_sql.lock() {
            if sql.contains(poison.as_str()) {
                return Err(DbError::driver(format!("refusing to execute '{sql}'")));
            }
        }
        self.state.executed.lock().push(sql.to_owned());
        Ok(1)
    }
}

impl RawStatement for MemoryStatement {
    fn mode(&self) -> StatementMode {
        self.mode
    }

    fn execute(&self, sql: &str) -> Result<u64> {
        self.run(sql)
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.run(sql)?;
        Ok(vec![Row::new(vec![Value::Int(1)])])
    }

    fn close_results(&self) -> Result<()> {
        if self.state.fail_recycle.load(Ordering::SeqCst) {
            return Err(DbError::driver("result set stuck open"));
        }
        Ok(())
    }

    fn clear_warnings(&self) -> Result<()> {
        Ok(())
    }

    fn clear_batch(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.state.fail_statement_close.load(Ordering::SeqCst) {
            return Err(DbError::driver("statement refuses to close"));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.statements_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl RawPreparedStatement for MemoryStatement {
    fn bind(&self, index: usize, value: Value) -> Result<()> {
        self.params.lock().insert(index, value);
        Ok(())
    }

    fn clear_parameters(&self) -> Result<()> {
        self.params.lock().clear();
        Ok(())
    }

    fn execute_prepared(&self) -> Result<u64> {
        let sql = self.sql.clone().unwrap_or_default();
        self.run(&sql)
    }

    fn query_prepared(&self) -> Result<Vec<Row>> {
        let sql = self.sql.clone().unwrap_or_default();
        self.run(&sql)?;
        Ok(vec![Row::new(vec![Value::Int(1)])])
    }
}

impl RawCallableStatement for MemoryStatement {
    fn register_out_param(&self, _index: usize) -> Result<()> {
        Ok(())
    }

    fn out_value(&self, index: usize) -> Result<Value> {
        Ok(self
            .params
            .lock()
            .get(&index)
            .cloned()
            .unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_driver_counts_connects_per_url() {
        let driver = MemoryDriver::default();
        let options = ConnectOptions::default();
        let _a = driver.connect("memory:one", &options).unwrap();
        let _b = driver.connect("memory:one", &options).unwrap();
        let _c = driver.connect("memory:two", &options).unwrap();
        assert_eq!(driver.state("memory:one").connects.load(Ordering::SeqCst), 2);
        assert_eq!(driver.state("memory:two").connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scripted_connect_failures_run_out() {
        let driver = MemoryDriver::default();
        driver
            .state("memory:flaky")
            .fail_connects
            .store(2, Ordering::SeqCst);
        let options = ConnectOptions::default();
        assert!(driver.connect("memory:flaky", &options).is_err());
        assert!(driver.connect("memory:flaky", &options).is_err());
        assert!(driver.connect("memory:flaky", &options).is_ok());
    }

    #[test]
    fn scripted_validation_budget_trips_per_session() {
        let driver = MemoryDriver::default();
        driver
            .state("memory:probes")
            .fail_validation_after
            .store(2, Ordering::SeqCst);

        let conn = driver
            .connect("memory:probes", &ConnectOptions::default())
            .unwrap();
        assert!(!conn.is_closed());
        assert!(!conn.is_closed());
        assert!(conn.is_closed());
        // Once tripped, round trips fail too.
        assert!(conn.set_auto_commit(true).is_err());

        // A fresh session starts with a fresh budget.
        let fresh = driver
            .connect("memory:probes", &ConnectOptions::default())
            .unwrap();
        assert!(!fresh.is_closed());
    }

    #[test]
    fn poisoned_sql_fails_and_is_not_recorded() {
        let driver = MemoryDriver::default();
        let conn = driver
            .connect("memory:poison", &ConnectOptions::default())
            .unwrap();
        let state = driver.state("memory:poison");
        *state.poison_sql.lock() = Some("DROP".to_owned());
        let stmt = conn.create_statement(StatementMode::default()).unwrap();
        assert!(stmt.execute("DROP TABLE users").is_err());
        assert_eq!(stmt.execute("SELECT 1").unwrap(), 1);
        assert_eq!(state.executed.lock().as_slice(), ["SELECT 1".to_owned()]);
    }
}
