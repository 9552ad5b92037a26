//! Error types for the database layer.

use thiserror::Error;

use repool::PoolError;

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors surfaced by drivers, sessions and the pool manager.
#[derive(Error, Debug)]
pub enum DbError {
    /// No registered driver accepts the connection URL.
    #[error("no registered driver accepts url '{url}'")]
    NoDriver {
        /// The offending URL
        url: String,
    },

    /// A driver-level failure, reported in the driver's own words.
    #[error("driver error: {message}")]
    Driver {
        /// The driver's description of the failure
        message: String,
    },

    /// Operation on a connection that has already been closed.
    #[error("connection already closed")]
    ConnectionClosed,

    /// One or more failures during session or pool teardown.
    ///
    /// Every underlying cause is retained in `causes`; teardown
    /// continues through all steps regardless of intermediate
    /// failures and reports them together.
    #[error("problem releasing connection resources ({} failure(s))", .causes.len())]
    ReleaseFailed {
        /// Each failure encountered during teardown, in order
        causes: Vec<DbError>,
    },

    /// Password decoding failed.
    #[error("unable to decode password: {message}")]
    Decode {
        /// What went wrong
        message: String,
    },

    /// A configuration file could not be loaded or understood.
    #[error("invalid configuration: {message}")]
    Config {
        /// What went wrong
        message: String,
    },

    /// The named pool does not exist in the manager.
    #[error("no pool named '{name}'")]
    UnknownPool {
        /// The requested pool name
        name: String,
    },

    /// Operation on a released pool manager.
    #[error("pool manager no longer valid for use")]
    ManagerReleased,

    /// An underlying pool failure (released pool, foreign item,
    /// creation failure with its root cause attached).
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Filesystem failure while loading configuration or logs.
    #[error("i/o error: {source}")]
    Io {
        /// The underlying error
        #[from]
        source: std::io::Error,
    },
}

impl DbError {
    /// Create a driver error from a message.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    /// Create a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The teardown failures aggregated in a `ReleaseFailed`, if any.
    pub fn release_causes(&self) -> &[DbError] {
        match self {
            Self::ReleaseFailed { causes } => causes,
            _ => &[],
        }
    }
}
