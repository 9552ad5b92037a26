//! Error types for pool operations

use thiserror::Error;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors surfaced by pool check-out and check-in.
///
/// A check-out that finds the pool at its hard cap is not an error:
/// it returns `Ok(None)` and leaves retrying to the caller.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool has been released and no longer vends items.
    #[error("pool '{pool}' is no longer valid for use")]
    Released {
        /// The pool name
        pool: String,
    },

    /// An item was checked in that this pool never checked out.
    #[error("attempt to return an item not belonging to pool '{pool}'")]
    ForeignItem {
        /// The pool name
        pool: String,
    },

    /// The factory failed to create a new item.
    ///
    /// The underlying cause is passed through unchanged.
    #[error("unable to create a new pooled item")]
    CreateFailed {
        /// The factory's failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A freshly created item failed validation.
    #[error("unable to create a valid item for pool '{pool}'")]
    CreateInvalid {
        /// The pool name
        pool: String,
    },
}

impl PoolError {
    /// Create a `Released` error for the named pool.
    pub fn released(pool: impl Into<String>) -> Self {
        Self::Released { pool: pool.into() }
    }

    /// Create a `ForeignItem` error for the named pool.
    pub fn foreign_item(pool: impl Into<String>) -> Self {
        Self::ForeignItem { pool: pool.into() }
    }

    /// Wrap a factory failure.
    pub fn create_failed(
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::CreateFailed {
            source: source.into(),
        }
    }
}

/// Failure reported by [`Reusable::recycle`](crate::Reusable::recycle).
///
/// The pool reacts to a recycle failure by destroying the item instead
/// of returning it to the free list.
#[derive(Error, Debug)]
#[error("unable to recycle pooled item")]
pub struct RecycleError {
    /// The underlying failure
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl RecycleError {
    /// Wrap an underlying failure.
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}
