//! # repool
//!
//! A bounded, named pool of reusable items. The pool creates items on
//! demand up to a hard cap, validates idle items before handing them
//! out, recycles items on return, expires idle items in the background
//! and notifies listeners of lifecycle transitions.
//!
//! Blocking points are real OS-level waits: callers that ask for a
//! timeout park on the pool's condition variable until an item is
//! checked back in or the deadline passes. There is no async runtime.
//!
//! The pool itself knows nothing about what it holds. Supply a
//! [`ResourceFactory`] for the create / validate / destroy lifecycle
//! and implement [`Reusable`] on the pooled item so it can be restored
//! to a default state between borrowers.

mod entry;

pub mod error;
pub mod events;
pub mod pool;
pub mod reusable;

pub use error::{PoolError, RecycleError};
pub use events::{PoolEvent, PoolListener};
pub use pool::{AccessOrder, Pool, PoolParameters, PoolStats};
pub use reusable::{ResourceFactory, Reusable};
