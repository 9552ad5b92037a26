//! Free-list entry bookkeeping.

use std::time::{Duration, Instant};

/// A free-list record pairing an idle item with its expiry deadline.
///
/// An entry with no deadline never expires. The deadline is stamped
/// when the entry is created and re-stamped when the pool's expiry
/// parameter changes.
pub(crate) struct Entry<T> {
    item: T,
    deadline: Option<Instant>,
    last_access: Instant,
}

impl<T> Entry<T> {
    /// Wrap an idle item, stamping its deadline from `expiry`
    /// (zero = never expires).
    pub(crate) fn new(item: T, expiry: Duration) -> Self {
        let now = Instant::now();
        Self {
            item,
            deadline: (expiry > Duration::ZERO).then(|| now + expiry),
            last_access: now,
        }
    }

    pub(crate) fn item(&self) -> &T {
        &self.item
    }

    pub(crate) fn into_item(self) -> T {
        self.item
    }

    /// Whether the idle deadline has passed.
    pub(crate) fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() > d)
    }

    /// Re-stamp the deadline with a new expiry measured from now.
    pub(crate) fn set_expiry(&mut self, expiry: Duration) {
        self.deadline = (expiry > Duration::ZERO).then(|| Instant::now() + expiry);
    }

    #[allow(dead_code)]
    pub(crate) fn last_access(&self) -> Instant {
        self.last_access
    }
}
