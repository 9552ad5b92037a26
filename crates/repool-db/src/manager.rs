//! Multi-pool manager.
//!
//! A manager owns every pool defined by one configuration file.
//! Managers loaded from a file are cached process-wide per canonical
//! path and reference-counted: each `from_file` hit increments a
//! client count, each `release` decrements it, and the pools are only
//! torn down when the count reaches zero.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing_subscriber::fmt::time::ChronoLocal;

use crate::config::ManagerConfig;
use crate::decoder;
use crate::driver;
use crate::error::{DbError, Result};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::validator;

static MANAGERS: Lazy<DashMap<PathBuf, Arc<PoolManager>>> = Lazy::new(DashMap::new);

/// Access and management for the pools defined in one configuration.
pub struct PoolManager {
    pools: HashMap<String, Arc<ConnectionPool>>,
    released: AtomicBool,
    clients: AtomicUsize,
    key: Option<PathBuf>,
}

impl PoolManager {
    /// The cached manager for a configuration file, loading it on
    /// first use (or again after a release). Every call counts one
    /// client; pair it with [`release`](Self::release).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let key = path
            .as_ref()
            .canonicalize()
            .map_err(|error| DbError::config(format!(
                "cannot resolve config path {}: {error}",
                path.as_ref().display()
            )))?;
        if let Some(existing) = MANAGERS.get(&key) {
            let manager = Arc::clone(existing.value());
            if !manager.is_released() {
                manager.clients.fetch_add(1, Ordering::SeqCst);
                return Ok(manager);
            }
        }
        let config = ManagerConfig::from_path(&key)?;
        let manager = Arc::new(Self::build(config, Some(key.clone())));
        manager.clients.store(1, Ordering::SeqCst);
        MANAGERS.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    /// Build an uncached manager straight from a configuration value.
    /// The caller is its only client.
    pub fn from_config(config: ManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self::build(config, None));
        manager.clients.store(1, Ordering::SeqCst);
        manager
    }

    fn build(config: ManagerConfig, key: Option<PathBuf>) -> Self {
        install_logging(config.logfile.as_deref(), config.dateformat.as_deref());

        for name in &config.drivers {
            if !driver::driver_registered(name) {
                tracing::warn!(driver = %name, "configured driver is not registered");
            }
        }

        let mut pools = HashMap::new();
        for (name, settings) in config.pool_settings() {
            let params = settings.parameters(&name);
            let pool = if settings.prop.is_empty() {
                match (&settings.user, &settings.password) {
                    (Some(user), password) => ConnectionPool::with_credentials(
                        name.clone(),
                        params,
                        settings.url.clone(),
                        user.clone(),
                        password.clone().unwrap_or_default(),
                    ),
                    (None, _) => {
                        ConnectionPool::with_url(name.clone(), params, settings.url.clone())
                    }
                }
            } else {
                let mut bag = settings.prop.clone();
                if let Some(user) = &settings.user {
                    bag.insert("user".to_owned(), user.clone());
                }
                if let Some(password) = &settings.password {
                    bag.insert("password".to_owned(), password.clone());
                }
                ConnectionPool::with_properties(name.clone(), params, settings.url.clone(), bag)
            };

            if let Some(validator_name) = settings.validator.as_deref() {
                match validator::validator_by_name(validator_name) {
                    Some(v) => pool.set_validator(Some(v)),
                    None if validator_name == "none" => pool.set_validator(None),
                    None => {
                        tracing::warn!(
                            pool = %name,
                            validator = %validator_name,
                            "unknown validator, keeping default"
                        );
                    }
                }
            }
            if let Some(decoder_name) = settings.decoder.as_deref() {
                match decoder::decoder_by_name(decoder_name) {
                    Some(d) => pool.set_password_decoder(Some(d)),
                    None => {
                        tracing::warn!(
                            pool = %name,
                            decoder = %decoder_name,
                            "unknown password decoder, ignoring"
                        );
                    }
                }
            }
            pool.set_caching(settings.cache);
            pool.set_async_destroy(settings.async_destroy);
            pool.set_debug(settings.debug);
            if settings.logfile.is_some() || settings.dateformat.is_some() {
                // One sink per process; per-pool output is separated by
                // the `pool` field rather than by file handle.
                tracing::info!(
                    pool = %name,
                    "per-pool log options noted; entries are tagged on the shared sink"
                );
            }

            tracing::info!(
                pool = %name,
                pool_size = params.pool_size,
                max_size = params.max_size,
                expiry_ms = params.expiry.as_millis() as u64,
                "initialized pool"
            );

            let init = settings.init_count(&name);
            if init > 0 {
                pool.init(init);
            }
            pools.insert(name, Arc::new(pool));
        }

        Self {
            pools,
            released: AtomicBool::new(false),
            clients: AtomicUsize::new(0),
            key,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            Err(DbError::ManagerReleased)
        } else {
            Ok(())
        }
    }

    /// The named pool.
    pub fn pool(&self, name: &str) -> Result<Arc<ConnectionPool>> {
        self.ensure_live()?;
        self.pools
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownPool {
                name: name.to_owned(),
            })
    }

    /// Every pool this manager owns.
    pub fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools.values().cloned().collect()
    }

    /// Borrow a session from the named pool.
    pub fn connection(&self, name: &str) -> Result<Option<PooledConnection>> {
        self.pool(name)?.connection()
    }

    /// Borrow a session from the named pool, waiting up to `timeout`.
    pub fn connection_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<PooledConnection>> {
        self.pool(name)?.connection_timeout(timeout)
    }

    /// Drop one client reference. When the last client releases, every
    /// pool is forcibly released and the manager leaves the cache.
    pub fn release(&self) {
        if self.clients.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in self.pools.values() {
            pool.release_forcibly();
        }
        if let Some(key) = &self.key {
            MANAGERS.remove(key);
        }
        tracing::info!("pool manager released");
    }

    /// Whether the manager has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Number of clients currently holding this manager.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("clients", &self.clients.load(Ordering::SeqCst))
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Install the process-wide log sink for the configured file and
/// timestamp format. If a subscriber is already installed (another
/// manager, or the host application) the existing sink is kept.
fn install_logging(logfile: Option<&str>, dateformat: Option<&str>) {
    let Some(path) = logfile else { return };
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => file,
        Err(error) => {
            eprintln!("can't open the log file {path}: {error}");
            return;
        }
    };
    let builder = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file));
    let installed = match dateformat {
        Some(format) => builder
            .with_timer(ChronoLocal::new(format.to_owned()))
            .try_init(),
        None => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("log subscriber already installed, keeping existing sink");
    }
}
