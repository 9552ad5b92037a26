//! The database connection pool: binds the generic pool to driver
//! sessions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use repool::{
    AccessOrder, Pool, PoolError, PoolListener, PoolParameters, PoolStats, ResourceFactory,
};

use crate::connection::CachingConnection;
use crate::decoder::{PasswordDecoder, SecureString};
use crate::driver::{self, ConnectOptions};
use crate::error::{DbError, Result};
use crate::validator::{ConnectionValidator, DefaultValidator};

/// Lifecycle hooks binding the generic pool to database sessions.
///
/// `create` opens a raw session through the driver registry using the
/// configured credential form, wraps it in a [`CachingConnection`] and
/// propagates the statement-cache flags. `validate` delegates to the
/// installed [`ConnectionValidator`]. `destroy` runs the session's
/// teardown path.
pub struct ConnectionFactory {
    url: String,
    user: Option<String>,
    password: Option<SecureString>,
    properties: Option<BTreeMap<String, String>>,
    decoder: RwLock<Option<Arc<dyn PasswordDecoder>>>,
    validator: RwLock<Option<Arc<dyn ConnectionValidator>>>,
    cache_simple: AtomicBool,
    cache_prepared: AtomicBool,
    cache_callable: AtomicBool,
    debug: AtomicBool,
    pool_name: String,
    pool: OnceCell<Weak<Pool<ConnectionFactory>>>,
}

impl ConnectionFactory {
    fn new(
        pool_name: String,
        url: String,
        user: Option<String>,
        password: Option<SecureString>,
        properties: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            url,
            user,
            password,
            properties,
            decoder: RwLock::new(None),
            validator: RwLock::new(Some(Arc::new(DefaultValidator))),
            cache_simple: AtomicBool::new(true),
            cache_prepared: AtomicBool::new(true),
            cache_callable: AtomicBool::new(true),
            debug: AtomicBool::new(false),
            pool_name,
            pool: OnceCell::new(),
        }
    }

    fn bind_pool(&self, pool: Weak<Pool<ConnectionFactory>>) {
        let _ = self.pool.set(pool);
    }

    fn decoded_password(&self) -> Result<Option<SecureString>> {
        match (&self.password, &*self.decoder.read()) {
            (None, _) => Ok(None),
            (Some(password), None) => Ok(Some(password.clone())),
            (Some(password), Some(decoder)) => decoder.decode(password.expose()).map(Some),
        }
    }

    /// Open a raw session using the configured credential form:
    /// properties bag (with decoded password injected into a copy),
    /// else user/password with a URL-only retry, else URL alone.
    fn open_raw(&self) -> Result<Box<dyn crate::driver::RawConnection>> {
        if let Some(properties) = &self.properties {
            let mut bag = properties.clone();
            if let Some(password) = self.decoded_password()? {
                bag.insert("password".to_owned(), password.expose().to_owned());
            }
            tracing::debug!(pool = %self.pool_name, url = %self.url, "getting connection (properties)");
            return driver::connect(&self.url, &ConnectOptions::from_properties(bag));
        }
        if let Some(user) = &self.user {
            let options = ConnectOptions {
                user: Some(user.clone()),
                password: self.decoded_password()?,
                properties: BTreeMap::new(),
            };
            tracing::debug!(pool = %self.pool_name, url = %self.url, "getting connection (user/pass)");
            return match driver::connect(&self.url, &options) {
                Ok(raw) => Ok(raw),
                Err(error) => {
                    tracing::warn!(
                        pool = %self.pool_name,
                        %error,
                        "failed to connect with standard authentication, retrying with url only"
                    );
                    driver::connect(&self.url, &ConnectOptions::default())
                }
            };
        }
        tracing::debug!(pool = %self.pool_name, url = %self.url, "getting connection (url only)");
        driver::connect(&self.url, &ConnectOptions::default())
    }
}

impl ResourceFactory for ConnectionFactory {
    type Item = CachingConnection;

    fn create(&self) -> std::result::Result<Arc<CachingConnection>, PoolError> {
        let raw = self.open_raw().map_err(|error| {
            tracing::warn!(pool = %self.pool_name, url = %self.url, %error, "can't create a new connection");
            PoolError::create_failed(error)
        })?;
        let session = CachingConnection::new(
            raw,
            self.pool.get().cloned().unwrap_or_default(),
            self.pool_name.clone(),
            self.cache_simple.load(Ordering::SeqCst),
            self.cache_prepared.load(Ordering::SeqCst),
            self.cache_callable.load(Ordering::SeqCst),
            self.debug.load(Ordering::SeqCst),
        );
        for warning in session.take_warnings() {
            tracing::info!(pool = %self.pool_name, warning = %warning, "connection warning");
        }
        tracing::debug!(pool = %self.pool_name, "created a new connection");
        Ok(session)
    }

    fn validate(&self, item: &CachingConnection) -> bool {
        match &*self.validator.read() {
            None => true,
            Some(validator) => validator.is_valid(item),
        }
    }

    fn destroy(&self, item: &CachingConnection) {
        match item.release() {
            Ok(()) => tracing::debug!(pool = %self.pool_name, "destroyed connection"),
            Err(error) => {
                tracing::warn!(pool = %self.pool_name, %error, "can't destroy connection");
            }
        }
    }
}

/// A named pool of database sessions with statement caching.
///
/// Borrowed sessions come back as [`PooledConnection`] guards;
/// dropping or closing the guard checks the session back in.
pub struct ConnectionPool {
    pool: Arc<Pool<ConnectionFactory>>,
}

impl ConnectionPool {
    /// Create a pool that connects with `(url, user, password)`
    /// credentials, falling back to `(url)` alone if the driver
    /// rejects them.
    pub fn with_credentials(
        name: impl Into<String>,
        params: PoolParameters,
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let factory = ConnectionFactory::new(
            name.clone(),
            url.into(),
            Some(user.into()),
            Some(SecureString::new(password)),
            None,
        );
        Self::build(name, factory, params)
    }

    /// Create a pool that connects with `(url, properties)`. The
    /// `user` and `password` keys of the bag carry the credentials;
    /// everything else passes through to the driver.
    pub fn with_properties(
        name: impl Into<String>,
        params: PoolParameters,
        url: impl Into<String>,
        properties: BTreeMap<String, String>,
    ) -> Self {
        let name = name.into();
        let password = properties.get("password").cloned().map(SecureString::new);
        let factory = ConnectionFactory::new(
            name.clone(),
            url.into(),
            None,
            password,
            Some(properties),
        );
        Self::build(name, factory, params)
    }

    /// Create a pool that connects with the URL alone.
    pub fn with_url(
        name: impl Into<String>,
        params: PoolParameters,
        url: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let factory = ConnectionFactory::new(name.clone(), url.into(), None, None, None);
        Self::build(name, factory, params)
    }

    fn build(name: String, factory: ConnectionFactory, params: PoolParameters) -> Self {
        let pool = Pool::new(name, factory, params);
        pool.factory().bind_pool(pool.downgrade());
        Self { pool }
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        self.pool.name()
    }

    /// Borrow a session.
    ///
    /// Returns `Ok(None)` when the pool is at its hard cap with every
    /// session in use.
    pub fn connection(&self) -> Result<Option<PooledConnection>> {
        match self.pool.check_out() {
            Ok(Some(session)) => {
                session.set_open();
                Ok(Some(PooledConnection {
                    session: Some(session),
                }))
            }
            Ok(None) => Ok(None),
            Err(error) => Err(DbError::Pool(error)),
        }
    }

    /// Borrow a session, waiting up to `timeout` for one to come back
    /// if the pool is at its hard cap. Returns `Ok(None)` at the
    /// deadline.
    pub fn connection_timeout(&self, timeout: Duration) -> Result<Option<PooledConnection>> {
        match self.pool.check_out_timeout(timeout) {
            Ok(Some(session)) => {
                session.set_open();
                Ok(Some(PooledConnection {
                    session: Some(session),
                }))
            }
            Ok(None) => Ok(None),
            Err(error) => Err(DbError::Pool(error)),
        }
    }

    /// Install or clear the connection validator. `None` means every
    /// idle session is considered valid.
    pub fn set_validator(&self, validator: Option<Arc<dyn ConnectionValidator>>) {
        *self.pool.factory().validator.write() = validator;
    }

    /// Install or clear the password decoder.
    pub fn set_password_decoder(&self, decoder: Option<Arc<dyn PasswordDecoder>>) {
        *self.pool.factory().decoder.write() = decoder;
    }

    /// Enable or disable statement caching for all three families on
    /// sessions created from now on.
    pub fn set_caching(&self, enable: bool) {
        self.set_caching_each(enable, enable, enable);
    }

    /// Per-family statement-caching flags for sessions created from
    /// now on.
    pub fn set_caching_each(&self, simple: bool, prepared: bool, callable: bool) {
        let factory = self.pool.factory();
        factory.cache_simple.store(simple, Ordering::SeqCst);
        factory.cache_prepared.store(prepared, Ordering::SeqCst);
        factory.cache_callable.store(callable, Ordering::SeqCst);
    }

    /// Enable verbose hit/miss logging on sessions created from now
    /// on.
    pub fn set_debug(&self, enable: bool) {
        self.pool.factory().debug.store(enable, Ordering::SeqCst);
    }

    /// Prepopulate the pool in the background until it holds `count`
    /// sessions (clamped to the soft cap).
    pub fn init(&self, count: usize) {
        self.pool.init(count);
    }

    /// Change sizing and expiry parameters; resets the hit counters.
    pub fn set_parameters(&self, params: PoolParameters) {
        self.pool.set_parameters(params);
    }

    /// Change the idle hand-out order.
    pub fn set_access_order(&self, access: AccessOrder) {
        self.pool.set_access_order(access);
    }

    /// Enable or disable asynchronous destruction.
    pub fn set_async_destroy(&self, enabled: bool) {
        self.pool.set_async_destroy(enabled);
    }

    /// Release the pool, waiting for borrowed sessions to drain.
    pub fn release(&self) {
        self.pool.release();
    }

    /// Release the pool, forcibly destroying borrowed sessions.
    pub fn release_forcibly(&self) {
        self.pool.release_forcibly();
    }

    /// Release on a background thread and return immediately.
    pub fn release_async(&self, force: bool) {
        self.pool.release_async(force);
    }

    /// Destroy every idle session now.
    pub fn flush(&self) {
        self.pool.flush();
    }

    /// Whether the pool has been released.
    pub fn is_released(&self) -> bool {
        self.pool.is_released()
    }

    /// Subscribe a listener to pool events.
    pub fn add_listener(&self, listener: Arc<dyn PoolListener>) {
        self.pool.add_listener(listener);
    }

    /// Unsubscribe a listener.
    pub fn remove_listener(&self, listener: &Arc<dyn PoolListener>) {
        self.pool.remove_listener(listener);
    }

    /// A snapshot of sizes and counters.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Total sessions held (idle and borrowed).
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    /// Idle sessions available for borrowing.
    pub fn free_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Sessions currently borrowed.
    pub fn checked_out(&self) -> usize {
        self.pool.checked_out()
    }

    /// Hit rate of the pool as a percentage.
    pub fn hit_rate(&self) -> f64 {
        self.pool.hit_rate()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name())
            .field("stats", &self.pool.stats())
            .finish()
    }
}

/// A borrowed session.
///
/// Dereferences to [`CachingConnection`]. Dropping the guard returns
/// the session to the pool; [`close`](PooledConnection::close) does
/// the same but surfaces any check-in failure.
pub struct PooledConnection {
    session: Option<Arc<CachingConnection>>,
}

impl PooledConnection {
    /// Return the session to the pool, surfacing check-in failures.
    pub fn close(mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.close(),
            None => Err(DbError::ConnectionClosed),
        }
    }

    /// The shared session handle, for callers that need to hold it
    /// beyond the guard (for example to exercise double-close
    /// semantics).
    pub fn session(&self) -> Arc<CachingConnection> {
        Arc::clone(self.session.as_ref().expect("session already taken"))
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = CachingConnection;

    fn deref(&self) -> &CachingConnection {
        self.session.as_ref().expect("session already taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(error) = session.close() {
                tracing::warn!(pool = %session.pool_name(), %error, "error returning connection to pool");
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("session", &self.session)
            .finish()
    }
}
