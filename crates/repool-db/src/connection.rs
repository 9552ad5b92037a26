//! The caching session: a facade over a raw driver session that vends
//! cached statement wrappers and routes `close()` back to its pool.
//!
//! Each of the three statement families (simple, prepared, callable)
//! has its own cache and its own mutex, so operations on different
//! families proceed concurrently on the same session. Every wrapper
//! the session vends is in exactly one of: the idle cache, the in-use
//! set, the non-cachable set, or destroyed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use repool::{Pool, RecycleError, Reusable};

use crate::driver::{KeyedRequest, RawConnection};
use crate::error::{DbError, Result};
use crate::mode::StatementMode;
use crate::pool::ConnectionFactory;
use crate::statement::{CachedCallableStatement, CachedPreparedStatement, CachedStatement};

fn cache_hit_rate(hits: u64, requests: u64) -> f64 {
    if requests == 0 {
        0.0
    } else {
        (hits as f64 / requests as f64) * 100.0
    }
}

/// Counters and sizes for one statement family.
#[derive(Debug, Clone, Copy, Default)]
pub struct FamilyStats {
    /// Vend requests while caching was enabled.
    pub requests: u64,
    /// Vends satisfied from the idle cache.
    pub hits: u64,
    /// Idle wrappers currently cached.
    pub spare: usize,
    /// Wrappers currently vended.
    pub open: usize,
}

impl FamilyStats {
    /// `hits / requests` as a percentage; 0 when no requests.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        cache_hit_rate(self.hits, self.requests)
    }
}

/// A snapshot of all three family caches plus the non-cachable set.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Simple statements.
    pub simple: FamilyStats,
    /// Prepared statements.
    pub prepared: FamilyStats,
    /// Callable statements.
    pub callable: FamilyStats,
    /// Statements that opted out of caching.
    pub non_cachable: usize,
}

struct SimpleFamily {
    enabled: bool,
    idle: Vec<Arc<CachedStatement>>,
    in_use: Vec<Arc<CachedStatement>>,
    requests: u64,
    hits: u64,
}

struct KeyedFamily<W> {
    enabled: bool,
    idle: HashMap<String, Vec<Arc<W>>>,
    in_use: Vec<Arc<W>>,
    requests: u64,
    hits: u64,
}

impl<W> KeyedFamily<W> {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            idle: HashMap::new(),
            in_use: Vec::new(),
            requests: 0,
            hits: 0,
        }
    }

    fn spare_count(&self) -> usize {
        self.idle.values().map(Vec::len).sum()
    }
}

/// Behaviour shared by every cached wrapper family.
trait Wrapper: Send + Sync + 'static {
    fn mode(&self) -> StatementMode;
    fn set_open(&self);
    fn mark_closed(&self);
    fn recycle(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
}

/// Wrappers additionally indexed by their SQL text.
trait KeyedWrapper: Wrapper {
    fn sql(&self) -> &str;
}

macro_rules! impl_wrapper {
    ($ty:ty) => {
        impl Wrapper for $ty {
            fn mode(&self) -> StatementMode {
                <$ty>::mode(self)
            }
            fn set_open(&self) {
                <$ty>::set_open(self);
            }
            fn mark_closed(&self) {
                <$ty>::mark_closed(self);
            }
            fn recycle(&self) -> Result<()> {
                <$ty>::recycle(self)
            }
            fn release(&self) -> Result<()> {
                <$ty>::release(self)
            }
        }
    };
}

impl_wrapper!(CachedStatement);
impl_wrapper!(CachedPreparedStatement);
impl_wrapper!(CachedCallableStatement);

impl KeyedWrapper for CachedPreparedStatement {
    fn sql(&self) -> &str {
        CachedPreparedStatement::sql(self)
    }
}

impl KeyedWrapper for CachedCallableStatement {
    fn sql(&self) -> &str {
        CachedCallableStatement::sql(self)
    }
}

/// A pooled database session with per-family statement caching.
///
/// `close()` does not close the underlying raw session; it hands the
/// session back to its pool. The raw session is only closed when the
/// pool destroys the wrapper.
pub struct CachingConnection {
    pool: Weak<Pool<ConnectionFactory>>,
    pool_name: String,
    weak_self: Weak<CachingConnection>,
    raw: Box<dyn RawConnection>,
    open: AtomicBool,
    debug: bool,
    simple: Mutex<SimpleFamily>,
    prepared: Mutex<KeyedFamily<CachedPreparedStatement>>,
    callable: Mutex<KeyedFamily<CachedCallableStatement>>,
    non_cachable: Mutex<Vec<Arc<CachedPreparedStatement>>>,
}

impl CachingConnection {
    pub(crate) fn new(
        raw: Box<dyn RawConnection>,
        pool: Weak<Pool<ConnectionFactory>>,
        pool_name: String,
        cache_simple: bool,
        cache_prepared: bool,
        cache_callable: bool,
        debug: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pool,
            pool_name,
            weak_self: weak.clone(),
            raw,
            open: AtomicBool::new(true),
            debug,
            simple: Mutex::new(SimpleFamily {
                enabled: cache_simple,
                idle: Vec::new(),
                in_use: Vec::new(),
                requests: 0,
                hits: 0,
            }),
            prepared: Mutex::new(KeyedFamily::new(cache_prepared)),
            callable: Mutex::new(KeyedFamily::new(cache_callable)),
            non_cachable: Mutex::new(Vec::new()),
        })
    }

    /// The name of the owning pool.
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// The raw driver session, for driver-specific escape hatches.
    ///
    /// Destabilising the raw session destabilises the pool; treat it
    /// as read-mostly.
    pub fn raw(&self) -> &dyn RawConnection {
        self.raw.as_ref()
    }

    pub(crate) fn set_open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Whether the session is currently vended to a borrower.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::ConnectionClosed)
        }
    }

    // ------------------------------------------------------------------
    // Vending
    // ------------------------------------------------------------------

    /// Vend a simple statement with the default mode.
    pub fn create_statement(&self) -> Result<Arc<CachedStatement>> {
        self.create_statement_with(StatementMode::default())
    }

    /// Vend a simple statement with the given mode.
    pub fn create_statement_with(&self, mode: StatementMode) -> Result<Arc<CachedStatement>> {
        self.ensure_open()?;
        let mut family = self.simple.lock();
        if !family.enabled {
            let raw = self.raw.create_statement(mode)?;
            let stmt = Arc::new(CachedStatement::new(raw, mode, self.weak_self.clone()));
            family.in_use.push(Arc::clone(&stmt));
            return Ok(stmt);
        }
        family.requests += 1;
        if let Some(position) = family.idle.iter().position(|s| s.mode() == mode) {
            let stmt = family.idle.remove(position);
            stmt.set_open();
            family.hits += 1;
            if self.debug {
                tracing::debug!(
                    pool = %self.pool_name,
                    ?mode,
                    hit_rate = cache_hit_rate(family.hits, family.requests),
                    "statement cache hit"
                );
            }
            family.in_use.push(Arc::clone(&stmt));
            return Ok(stmt);
        }
        let raw = self.raw.create_statement(mode)?;
        let stmt = Arc::new(CachedStatement::new(raw, mode, self.weak_self.clone()));
        if self.debug {
            tracing::debug!(
                pool = %self.pool_name,
                ?mode,
                hit_rate = cache_hit_rate(family.hits, family.requests),
                "statement cache miss"
            );
        }
        family.in_use.push(Arc::clone(&stmt));
        Ok(stmt)
    }

    /// Vend a prepared statement with the default mode.
    pub fn prepare_statement(&self, sql: &str) -> Result<Arc<CachedPreparedStatement>> {
        self.prepare_statement_with(sql, StatementMode::default())
    }

    /// Vend a prepared statement with the given mode.
    ///
    /// The idle cache is consulted under the key `(sql, mode)`; the
    /// first idle wrapper whose mode triple matches exactly is reused.
    pub fn prepare_statement_with(
        &self,
        sql: &str,
        mode: StatementMode,
    ) -> Result<Arc<CachedPreparedStatement>> {
        self.ensure_open()?;
        self.vend_keyed(&self.prepared, sql, mode, "prepared statement", || {
            let raw = self.raw.prepare_statement(sql, mode)?;
            Ok(Arc::new(CachedPreparedStatement::new(
                raw,
                sql.to_owned(),
                mode,
                self.weak_self.clone(),
            )))
        })
    }

    /// Vend a stored-procedure call with the default mode.
    pub fn prepare_call(&self, sql: &str) -> Result<Arc<CachedCallableStatement>> {
        self.prepare_call_with(sql, StatementMode::default())
    }

    /// Vend a stored-procedure call with the given mode.
    pub fn prepare_call_with(
        &self,
        sql: &str,
        mode: StatementMode,
    ) -> Result<Arc<CachedCallableStatement>> {
        self.ensure_open()?;
        self.vend_keyed(&self.callable, sql, mode, "callable statement", || {
            let raw = self.raw.prepare_call(sql, mode)?;
            Ok(Arc::new(CachedCallableStatement::new(
                raw,
                sql.to_owned(),
                mode,
                self.weak_self.clone(),
            )))
        })
    }

    /// Vend a prepared statement that reports generated keys or
    /// explicit columns. These are never cached: on close the raw
    /// statement is released.
    pub fn prepare_statement_keyed(
        &self,
        sql: &str,
        request: KeyedRequest,
    ) -> Result<Arc<CachedPreparedStatement>> {
        self.ensure_open()?;
        let raw = self.raw.prepare_statement_keyed(sql, request)?;
        let stmt = Arc::new(CachedPreparedStatement::new(
            raw,
            sql.to_owned(),
            StatementMode::default(),
            self.weak_self.clone(),
        ));
        self.non_cachable.lock().push(Arc::clone(&stmt));
        Ok(stmt)
    }

    fn vend_keyed<W: KeyedWrapper>(
        &self,
        family: &Mutex<KeyedFamily<W>>,
        sql: &str,
        mode: StatementMode,
        label: &str,
        create: impl FnOnce() -> Result<Arc<W>>,
    ) -> Result<Arc<W>> {
        let mut family = family.lock();
        if !family.enabled {
            let stmt = create()?;
            family.in_use.push(Arc::clone(&stmt));
            return Ok(stmt);
        }
        family.requests += 1;
        let mut found = None;
        if let Some(list) = family.idle.get_mut(sql) {
            if let Some(position) = list.iter().position(|s| s.mode() == mode) {
                found = Some(list.remove(position));
            }
            // Keep the map bounded: drop the key once its list empties.
            if list.is_empty() {
                family.idle.remove(sql);
            }
        }
        match found {
            Some(stmt) => {
                stmt.set_open();
                family.hits += 1;
                if self.debug {
                    tracing::debug!(
                        pool = %self.pool_name,
                        sql,
                        ?mode,
                        hit_rate = cache_hit_rate(family.hits, family.requests),
                        "{label} cache hit"
                    );
                }
                family.in_use.push(Arc::clone(&stmt));
                Ok(stmt)
            }
            None => {
                let stmt = create()?;
                if self.debug {
                    tracing::debug!(
                        pool = %self.pool_name,
                        sql,
                        ?mode,
                        hit_rate = cache_hit_rate(family.hits, family.requests),
                        "{label} cache miss"
                    );
                }
                family.in_use.push(Arc::clone(&stmt));
                Ok(stmt)
            }
        }
    }

    // ------------------------------------------------------------------
    // Return path
    // ------------------------------------------------------------------

    pub(crate) fn simple_closed(&self, stmt: &CachedStatement) -> Result<()> {
        let mut family = self.simple.lock();
        let Some(position) = family
            .in_use
            .iter()
            .position(|s| std::ptr::eq(Arc::as_ptr(s), stmt))
        else {
            drop(family);
            return stmt.release();
        };
        let stmt = family.in_use.remove(position);
        if !family.enabled {
            drop(family);
            return stmt.release();
        }
        match stmt.recycle() {
            Ok(()) => {
                family.idle.push(stmt);
                Ok(())
            }
            Err(_) => {
                drop(family);
                stmt.release()
            }
        }
    }

    pub(crate) fn prepared_closed(&self, stmt: &CachedPreparedStatement) -> Result<()> {
        self.keyed_closed(&self.prepared, Some(&self.non_cachable), stmt)
    }

    pub(crate) fn callable_closed(&self, stmt: &CachedCallableStatement) -> Result<()> {
        self.keyed_closed(&self.callable, None, stmt)
    }

    fn keyed_closed<W: KeyedWrapper>(
        &self,
        family: &Mutex<KeyedFamily<W>>,
        non_cachable: Option<&Mutex<Vec<Arc<W>>>>,
        stmt: &W,
    ) -> Result<()> {
        {
            let mut family = family.lock();
            if let Some(position) = family
                .in_use
                .iter()
                .position(|s| std::ptr::eq(Arc::as_ptr(s), stmt))
            {
                let stmt = family.in_use.remove(position);
                if !family.enabled {
                    drop(family);
                    return stmt.release();
                }
                return match stmt.recycle() {
                    Ok(()) => {
                        family
                            .idle
                            .entry(stmt.sql().to_owned())
                            .or_default()
                            .push(stmt);
                        Ok(())
                    }
                    Err(_) => {
                        drop(family);
                        stmt.release()
                    }
                };
            }
        }
        if let Some(non_cachable) = non_cachable {
            let mut set = non_cachable.lock();
            if let Some(position) = set
                .iter()
                .position(|s| std::ptr::eq(Arc::as_ptr(s), stmt))
            {
                let stmt = set.remove(position);
                drop(set);
                return stmt.release();
            }
        }
        stmt.release()
    }

    // ------------------------------------------------------------------
    // Cache flags
    // ------------------------------------------------------------------

    /// Enable or disable simple-statement caching.
    ///
    /// Disabling flushes the family's idle cache; wrappers already
    /// vended stay out and are released when closed.
    pub fn set_cache_statements(&self, enable: bool) {
        let flushed = {
            let mut family = self.simple.lock();
            let flush = family.enabled && !enable;
            family.enabled = enable;
            if flush {
                std::mem::take(&mut family.idle)
            } else {
                Vec::new()
            }
        };
        for stmt in flushed {
            if let Err(error) = stmt.release() {
                tracing::warn!(pool = %self.pool_name, %error, "failed closing spare statement");
            }
        }
    }

    /// Enable or disable prepared-statement caching; see
    /// [`set_cache_statements`](Self::set_cache_statements).
    pub fn set_cache_prepared(&self, enable: bool) {
        Self::set_keyed_enabled(&self.pool_name, &self.prepared, enable);
    }

    /// Enable or disable callable-statement caching; see
    /// [`set_cache_statements`](Self::set_cache_statements).
    pub fn set_cache_callable(&self, enable: bool) {
        Self::set_keyed_enabled(&self.pool_name, &self.callable, enable);
    }

    /// Apply one caching flag to all three families.
    pub fn set_cache_all(&self, enable: bool) {
        self.set_cache_statements(enable);
        self.set_cache_prepared(enable);
        self.set_cache_callable(enable);
    }

    fn set_keyed_enabled<W: KeyedWrapper>(
        pool_name: &str,
        family: &Mutex<KeyedFamily<W>>,
        enable: bool,
    ) {
        let flushed: Vec<Arc<W>> = {
            let mut family = family.lock();
            let flush = family.enabled && !enable;
            family.enabled = enable;
            if flush {
                family.idle.drain().flat_map(|(_, list)| list).collect()
            } else {
                Vec::new()
            }
        };
        for stmt in flushed {
            if let Err(error) = stmt.release() {
                tracing::warn!(pool = %pool_name, %error, "failed closing spare statement");
            }
        }
    }

    /// Whether simple-statement caching is enabled.
    pub fn is_caching_statements(&self) -> bool {
        self.simple.lock().enabled
    }

    /// Whether prepared-statement caching is enabled.
    pub fn is_caching_prepared(&self) -> bool {
        self.prepared.lock().enabled
    }

    /// Whether callable-statement caching is enabled.
    pub fn is_caching_callable(&self) -> bool {
        self.callable.lock().enabled
    }

    // ------------------------------------------------------------------
    // Raw session pass-throughs
    // ------------------------------------------------------------------

    /// Current auto-commit mode.
    pub fn auto_commit(&self) -> Result<bool> {
        self.raw.auto_commit()
    }

    /// Switch auto-commit on or off.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        self.raw.set_auto_commit(enabled)
    }

    /// Commit the open transaction.
    pub fn commit(&self) -> Result<()> {
        self.raw.commit()
    }

    /// Roll back the open transaction.
    pub fn rollback(&self) -> Result<()> {
        self.raw.rollback()
    }

    /// Drain and return any pending warnings.
    pub fn take_warnings(&self) -> Vec<String> {
        self.raw.take_warnings()
    }

    /// Discard pending warnings.
    pub fn clear_warnings(&self) -> Result<()> {
        self.raw.clear_warnings()
    }

    /// Whether the raw session reports itself closed.
    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Return the session to its pool.
    ///
    /// The raw session stays open; the pool decides whether to recycle
    /// or destroy the wrapper. Closing an already-closed session is an
    /// error.
    pub fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(DbError::ConnectionClosed);
        }
        let this = self
            .weak_self
            .upgrade()
            .ok_or(DbError::ConnectionClosed)?;
        match self.pool.upgrade() {
            Some(pool) => {
                pool.check_in(&this)?;
                Ok(())
            }
            // Orphaned from its pool: tear down for real.
            None => self.release(),
        }
    }

    /// Snapshot of all cache counters and sizes.
    pub fn cache_stats(&self) -> CacheStats {
        let simple = {
            let family = self.simple.lock();
            FamilyStats {
                requests: family.requests,
                hits: family.hits,
                spare: family.idle.len(),
                open: family.in_use.len(),
            }
        };
        let prepared = {
            let family = self.prepared.lock();
            FamilyStats {
                requests: family.requests,
                hits: family.hits,
                spare: family.spare_count(),
                open: family.in_use.len(),
            }
        };
        let callable = {
            let family = self.callable.lock();
            FamilyStats {
                requests: family.requests,
                hits: family.hits,
                spare: family.spare_count(),
                open: family.in_use.len(),
            }
        };
        CacheStats {
            simple,
            prepared,
            callable,
            non_cachable: self.non_cachable.lock().len(),
        }
    }

    fn recycle_for_reuse(&self) -> Result<()> {
        // Leaked in-use wrappers are forcibly closed for every family;
        // families whose caching is disabled lose their idle cache too.
        let leaked = {
            let simple = self.simple.lock().in_use.len();
            simple + self.prepared.lock().in_use.len() + self.callable.lock().in_use.len()
        };
        if leaked > 0 && self.debug {
            tracing::debug!(pool = %self.pool_name, leaked, "cleaning leaked statements");
        }
        self.flush_simple_open()?;
        if !self.simple.lock().enabled {
            self.flush_simple_spare()?;
        }
        Self::flush_keyed_open(&self.prepared)?;
        if !self.prepared.lock().enabled {
            Self::flush_keyed_spare(&self.prepared)?;
        }
        Self::flush_keyed_open(&self.callable)?;
        if !self.callable.lock().enabled {
            Self::flush_keyed_spare(&self.callable)?;
        }
        self.flush_non_cachable()?;

        // Restore driver-default transaction state.
        if !self.raw.auto_commit()? {
            if let Err(error) = self.raw.rollback() {
                tracing::warn!(pool = %self.pool_name, %error, "rollback failed during recycle");
            }
            self.raw.set_auto_commit(true)?;
        }
        self.raw.clear_warnings()?;
        self.raw.clear_type_map()?;
        Ok(())
    }

    fn flush_simple_spare(&self) -> Result<()> {
        let drained = std::mem::take(&mut self.simple.lock().idle);
        Self::release_all(drained)
    }

    fn flush_simple_open(&self) -> Result<()> {
        let drained = std::mem::take(&mut self.simple.lock().in_use);
        Self::release_all(drained)
    }

    fn flush_keyed_spare<W: KeyedWrapper>(family: &Mutex<KeyedFamily<W>>) -> Result<()> {
        let drained: Vec<Arc<W>> = family
            .lock()
            .idle
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        Self::release_all(drained)
    }

    fn flush_keyed_open<W: KeyedWrapper>(family: &Mutex<KeyedFamily<W>>) -> Result<()> {
        let drained = std::mem::take(&mut family.lock().in_use);
        Self::release_all(drained)
    }

    fn flush_non_cachable(&self) -> Result<()> {
        let drained = std::mem::take(&mut *self.non_cachable.lock());
        Self::release_all(drained)
    }

    /// Release every wrapper, reporting the first failure after all
    /// have been attempted. Each wrapper is latched closed first so a
    /// borrower's later `close()` on a stale handle is a no-op.
    fn release_all<W: Wrapper>(wrappers: Vec<Arc<W>>) -> Result<()> {
        let mut first_error = None;
        for stmt in wrappers {
            stmt.mark_closed();
            if let Err(error) = stmt.release() {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Tear the session down for good.
    ///
    /// Releases every wrapper of every family and the non-cachable
    /// set, then closes the raw session. Every failure along the way
    /// is collected; teardown continues regardless and reports them
    /// together as [`DbError::ReleaseFailed`].
    pub fn release(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let mut causes = Vec::new();

        if let Err(error) = self.flush_simple_spare() {
            causes.push(error);
        }
        if let Err(error) = self.flush_simple_open() {
            causes.push(error);
        }
        if let Err(error) = Self::flush_keyed_spare(&self.prepared) {
            causes.push(error);
        }
        if let Err(error) = Self::flush_keyed_open(&self.prepared) {
            causes.push(error);
        }
        if let Err(error) = Self::flush_keyed_spare(&self.callable) {
            causes.push(error);
        }
        if let Err(error) = Self::flush_keyed_open(&self.callable) {
            causes.push(error);
        }
        if let Err(error) = self.flush_non_cachable() {
            causes.push(error);
        }
        if let Err(error) = self.raw.close() {
            causes.push(error);
        }

        if causes.is_empty() {
            Ok(())
        } else {
            Err(DbError::ReleaseFailed { causes })
        }
    }
}

impl Reusable for CachingConnection {
    /// Restore the session to driver-default state for its next
    /// borrower: force-close leaked wrappers of cached families, flush
    /// uncached families entirely, roll back any open transaction and
    /// restore auto-commit, clear warnings and the type map.
    fn recycle(&self) -> std::result::Result<(), RecycleError> {
        self.recycle_for_reuse().map_err(RecycleError::new)
    }
}

impl std::fmt::Debug for CachingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingConnection")
            .field("pool", &self.pool_name)
            .field("open", &self.open.load(Ordering::SeqCst))
            .field("stats", &self.cache_stats())
            .finish()
    }
}
