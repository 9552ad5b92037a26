//! Lifecycle traits for pooled items.
//!
//! [`ResourceFactory`] owns creation, validation and destruction;
//! [`Reusable`] lets an item restore itself to a default state when it
//! moves back from a borrower to the free list.

use std::sync::Arc;

use crate::error::{PoolError, RecycleError};

/// An item that can be restored to a default state for its next
/// borrower.
///
/// Items live behind `Arc` handles, so `recycle` takes `&self` and
/// uses interior mutability.
pub trait Reusable: Send + Sync + 'static {
    /// Restore default state before the item re-enters the free list.
    ///
    /// On failure the pool destroys the item instead of reusing it.
    fn recycle(&self) -> Result<(), RecycleError>;
}

/// Lifecycle hooks supplied by the pool's owner.
pub trait ResourceFactory: Send + Sync + 'static {
    /// The pooled item type.
    type Item: Reusable;

    /// Create a new item.
    ///
    /// Called when a check-out finds no valid idle item and the hard
    /// cap has not been reached, and by the background initialiser.
    fn create(&self) -> Result<Arc<Self::Item>, PoolError>;

    /// Check whether an idle item is still usable.
    ///
    /// Invalid items are destroyed and the check-out scan continues.
    /// Default implementation accepts everything.
    fn validate(&self, _item: &Self::Item) -> bool {
        true
    }

    /// Tear an item down when it leaves the pool for good.
    ///
    /// Failures must be handled (typically logged) by the
    /// implementation; the pool carries on regardless.
    fn destroy(&self, item: &Self::Item);
}
