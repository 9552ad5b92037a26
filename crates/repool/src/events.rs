//! Lifecycle event notification.
//!
//! Listeners are advisory observers. Events are fired after the owning
//! state transition has committed and outside the pool mutex, so a slow
//! or panicking listener can neither block the pool nor roll a
//! transition back.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Events emitted during pool operation.
///
/// The threshold events (`MaxPoolLimitReached`, `MaxPoolLimitExceeded`,
/// `MaxSizeLimitReached`) fire only when an operation causes the total
/// item count to *cross* the corresponding boundary upward; repeated
/// check-outs hovering at the same level do not re-fire them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// An item was checked out.
    CheckOut,
    /// An item was checked in.
    CheckIn,
    /// The total item count reached the soft cap.
    MaxPoolLimitReached,
    /// The total item count exceeded the soft cap.
    MaxPoolLimitExceeded,
    /// The total item count reached the hard cap.
    MaxSizeLimitReached,
    /// A check-out found every item at the hard cap in use.
    MaxSizeLimitError,
    /// An idle item failed validation during check-out and was
    /// discarded.
    ValidationError,
    /// Pool parameters were changed.
    ParametersChanged,
    /// The pool was released.
    Released,
}

/// Observer of pool lifecycle events.
///
/// Implementations must return quickly and must not call back into the
/// emitting pool.
pub trait PoolListener: Send + Sync {
    /// Called once per event, with the emitting pool's name.
    fn on_event(&self, pool: &str, event: PoolEvent);
}

impl<F> PoolListener for F
where
    F: Fn(&str, PoolEvent) + Send + Sync,
{
    fn on_event(&self, pool: &str, event: PoolEvent) {
        self(pool, event);
    }
}

/// Deliver `events` in order to every listener, isolating panics.
pub(crate) fn dispatch(
    pool: &str,
    listeners: &[Arc<dyn PoolListener>],
    events: &[PoolEvent],
) {
    if listeners.is_empty() {
        return;
    }
    for event in events {
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(pool, *event)));
            if result.is_err() {
                tracing::warn!(pool, ?event, "pool listener panicked; event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn dispatch_preserves_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = Arc::clone(&seen);
        let listener: Arc<dyn PoolListener> = Arc::new(move |_: &str, e: PoolEvent| {
            seen_c.lock().push(e);
        });
        dispatch(
            "p",
            &[listener],
            &[PoolEvent::CheckIn, PoolEvent::Released],
        );
        assert_eq!(*seen.lock(), vec![PoolEvent::CheckIn, PoolEvent::Released]);
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let seen = Arc::new(Mutex::new(0usize));
        let seen_c = Arc::clone(&seen);
        let bad: Arc<dyn PoolListener> = Arc::new(|_: &str, _: PoolEvent| {
            panic!("listener bug");
        });
        let good: Arc<dyn PoolListener> = Arc::new(move |_: &str, _: PoolEvent| {
            *seen_c.lock() += 1;
        });
        dispatch("p", &[bad, good], &[PoolEvent::CheckOut]);
        assert_eq!(*seen.lock(), 1);
    }
}
