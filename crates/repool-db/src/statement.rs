//! Cached statement wrappers.
//!
//! Each wrapper pairs a raw driver statement with the mode triple it
//! was created under, an open latch that makes repeat `close()` calls
//! no-ops, and a back-reference to the session that vended it. Closing
//! a wrapper does not close the raw statement; it hands the wrapper
//! back to the session, which recycles it into the idle cache or
//! releases it depending on the family's caching flag.
//!
//! The open latch and the execution surface use `&self`; a wrapper has
//! a single owner between vend and close, so no further locking is
//! needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use crate::connection::CachingConnection;
use crate::driver::{RawCallableStatement, RawPreparedStatement, RawStatement, Row, Value};
use crate::error::Result;
use crate::mode::StatementMode;

/// Clean a raw statement up so it can be reused or closed: close any
/// live result set, then clear warnings and batch, ignoring failures
/// from drivers that misbehave on the latter two.
fn recycle_raw<R: RawStatement + ?Sized>(raw: &R) -> Result<()> {
    raw.close_results()?;
    let _ = raw.clear_warnings();
    let _ = raw.clear_batch();
    Ok(())
}

/// A simple statement vended by a [`CachingConnection`].
pub struct CachedStatement {
    raw: Box<dyn RawStatement>,
    mode: StatementMode,
    open: AtomicBool,
    listener: Weak<CachingConnection>,
}

impl CachedStatement {
    pub(crate) fn new(
        raw: Box<dyn RawStatement>,
        mode: StatementMode,
        listener: Weak<CachingConnection>,
    ) -> Self {
        Self {
            raw,
            mode,
            open: AtomicBool::new(true),
            listener,
        }
    }

    /// The mode triple the statement was created with.
    pub fn mode(&self) -> StatementMode {
        self.mode
    }

    /// Whether the wrapper is still open (vended and not yet closed).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Hand the wrapper back to its session.
    ///
    /// The session recycles it into the idle cache or closes the raw
    /// statement, depending on whether simple-statement caching is
    /// enabled. A second `close` is a no-op.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.listener.upgrade() {
            Some(session) => session.simple_closed(self),
            None => self.release(),
        }
    }

    /// Prepare the raw statement for its next borrower.
    pub(crate) fn recycle(&self) -> Result<()> {
        recycle_raw(self.raw.as_ref())
    }

    /// Close the raw statement for good.
    pub(crate) fn release(&self) -> Result<()> {
        self.raw.close()
    }

    /// Execute an update, returning the affected-row count.
    pub fn execute(&self, sql: &str) -> Result<u64> {
        self.raw.execute(sql)
    }

    /// Execute a query, returning its rows.
    pub fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.raw.query(sql)
    }
}

/// A prepared statement vended by a [`CachingConnection`], keyed in
/// the cache by its SQL text and mode triple.
pub struct CachedPreparedStatement {
    raw: Box<dyn RawPreparedStatement>,
    sql: String,
    mode: StatementMode,
    open: AtomicBool,
    listener: Weak<CachingConnection>,
}

impl CachedPreparedStatement {
    pub(crate) fn new(
        raw: Box<dyn RawPreparedStatement>,
        sql: String,
        mode: StatementMode,
        listener: Weak<CachingConnection>,
    ) -> Self {
        Self {
            raw,
            sql,
            mode,
            open: AtomicBool::new(true),
            listener,
        }
    }

    /// The SQL text the statement was prepared from. Never changes
    /// after creation.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The mode triple the statement was created with.
    pub fn mode(&self) -> StatementMode {
        self.mode
    }

    /// Whether the wrapper is still open (vended and not yet closed).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Hand the wrapper back to its session; see
    /// [`CachedStatement::close`].
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.listener.upgrade() {
            Some(session) => session.prepared_closed(self),
            None => self.release(),
        }
    }

    /// Prepare the raw statement for its next borrower. Parameters are
    /// cleared on top of the base clean-up; the spurious failure some
    /// drivers report when no parameters were bound is ignored.
    pub(crate) fn recycle(&self) -> Result<()> {
        recycle_raw(self.raw.as_ref())?;
        let _ = self.raw.clear_parameters();
        Ok(())
    }

    /// Close the raw statement for good.
    pub(crate) fn release(&self) -> Result<()> {
        self.raw.close()
    }

    /// Bind a parameter by 1-based index.
    pub fn bind(&self, index: usize, value: Value) -> Result<()> {
        self.raw.bind(index, value)
    }

    /// Clear all bound parameters.
    pub fn clear_parameters(&self) -> Result<()> {
        self.raw.clear_parameters()
    }

    /// Execute the prepared update.
    pub fn execute(&self) -> Result<u64> {
        self.raw.execute_prepared()
    }

    /// Execute the prepared query.
    pub fn query(&self) -> Result<Vec<Row>> {
        self.raw.query_prepared()
    }
}

/// A stored-procedure call vended by a [`CachingConnection`], keyed in
/// the cache by its SQL text and mode triple.
pub struct CachedCallableStatement {
    raw: Box<dyn RawCallableStatement>,
    sql: String,
    mode: StatementMode,
    open: AtomicBool,
    listener: Weak<CachingConnection>,
}

impl CachedCallableStatement {
    pub(crate) fn new(
        raw: Box<dyn RawCallableStatement>,
        sql: String,
        mode: StatementMode,
        listener: Weak<CachingConnection>,
    ) -> Self {
        Self {
            raw,
            sql,
            mode,
            open: AtomicBool::new(true),
            listener,
        }
    }

    /// The SQL text the call was prepared from. Never changes after
    /// creation.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The mode triple the statement was created with.
    pub fn mode(&self) -> StatementMode {
        self.mode
    }

    /// Whether the wrapper is still open (vended and not yet closed).
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Hand the wrapper back to its session; see
    /// [`CachedStatement::close`].
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        match self.listener.upgrade() {
            Some(session) => session.callable_closed(self),
            None => self.release(),
        }
    }

    /// Prepare the raw statement for its next borrower; see
    /// [`CachedPreparedStatement::recycle`].
    pub(crate) fn recycle(&self) -> Result<()> {
        recycle_raw(self.raw.as_ref())?;
        let _ = self.raw.clear_parameters();
        Ok(())
    }

    /// Close the raw statement for good.
    pub(crate) fn release(&self) -> Result<()> {
        self.raw.close()
    }

    /// Bind a parameter by 1-based index.
    pub fn bind(&self, index: usize, value: Value) -> Result<()> {
        self.raw.bind(index, value)
    }

    /// Register a 1-based parameter index as an out-parameter.
    pub fn register_out_param(&self, index: usize) -> Result<()> {
        self.raw.register_out_param(index)
    }

    /// Read an out-parameter after execution.
    pub fn out_value(&self, index: usize) -> Result<Value> {
        self.raw.out_value(index)
    }

    /// Execute the prepared call as an update.
    pub fn execute(&self) -> Result<u64> {
        self.raw.execute_prepared()
    }

    /// Execute the prepared call as a query.
    pub fn query(&self) -> Result<Vec<Row>> {
        self.raw.query_prepared()
    }
}
