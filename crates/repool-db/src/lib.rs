//! # repool-db
//!
//! Database connection pooling with per-connection statement caching,
//! built on the generic [`repool`] pool.
//!
//! Three layers:
//!
//! - a [`driver`] abstraction describing the raw session surface the
//!   pooling layers need, with a process-wide driver registry;
//! - the [`ConnectionPool`], which binds the generic pool's
//!   create / validate / destroy lifecycle to driver sessions;
//! - the [`CachingConnection`] wrapped around every pooled session,
//!   which vends statement wrappers indexed by SQL text and result-set
//!   mode and hands itself back to the pool on `close()`.
//!
//! A [`manager::PoolManager`] loads multiple named pools from a TOML
//! configuration file and tracks its clients by reference count.
//!
//! ```no_run
//! use repool::PoolParameters;
//! use repool_db::ConnectionPool;
//!
//! # fn main() -> repool_db::Result<()> {
//! repool_db::testing::memory_driver();
//! let pool = ConnectionPool::with_url(
//!     "main",
//!     PoolParameters { pool_size: 4, max_size: 8, expiry: std::time::Duration::from_secs(60) },
//!     "memory:main",
//! );
//! let conn = pool.connection()?.expect("pool not exhausted");
//! let stmt = conn.prepare_statement("SELECT 1")?;
//! stmt.execute()?;
//! stmt.close()?;
//! conn.close()?;
//! pool.release();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod decoder;
pub mod driver;
pub mod error;
pub mod manager;
pub mod mode;
pub mod pool;
pub mod statement;
pub mod testing;
pub mod validator;

pub use config::{ManagerConfig, PoolSettings};
pub use connection::{CacheStats, CachingConnection, FamilyStats};
pub use decoder::{PasswordDecoder, RotDecoder, SecureString};
pub use driver::{ConnectOptions, Driver, KeyedRequest, Row, Value};
pub use error::{DbError, Result};
pub use manager::PoolManager;
pub use mode::{Concurrency, Holdability, ResultSetKind, StatementMode};
pub use pool::{ConnectionPool, PooledConnection};
pub use statement::{CachedCallableStatement, CachedPreparedStatement, CachedStatement};
pub use validator::{AutoCommitValidator, ConnectionValidator, DefaultValidator};
