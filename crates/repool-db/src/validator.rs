//! Connection validation.
//!
//! A validator is consulted at check-out time to confirm that an idle
//! session is still usable. Validators are registered by name so
//! configuration files can refer to them.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::connection::CachingConnection;

/// Pluggable predicate confirming an idle session is still usable.
///
/// Returning `false` makes the pool discard the session and continue
/// its scan; it is never surfaced to the borrower.
pub trait ConnectionValidator: Send + Sync {
    /// Whether the session can be handed to a borrower.
    fn is_valid(&self, connection: &CachingConnection) -> bool;
}

/// The stock validator: a session is valid while the driver does not
/// report it closed.
///
/// Drivers typically only report a session closed after an explicit
/// close, so this check is cheap but not rigorous. Use
/// [`AutoCommitValidator`] when a round-trip test is wanted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl ConnectionValidator for DefaultValidator {
    fn is_valid(&self, connection: &CachingConnection) -> bool {
        !connection.is_closed()
    }
}

/// Validates by issuing `set_auto_commit(true)` and checking it
/// succeeds, forcing a round trip on drivers that talk to the server
/// for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoCommitValidator;

impl ConnectionValidator for AutoCommitValidator {
    fn is_valid(&self, connection: &CachingConnection) -> bool {
        connection.set_auto_commit(true).is_ok()
    }
}

static VALIDATORS: Lazy<RwLock<HashMap<String, Arc<dyn ConnectionValidator>>>> =
    Lazy::new(|| {
        let mut map: HashMap<String, Arc<dyn ConnectionValidator>> = HashMap::new();
        map.insert("default".to_owned(), Arc::new(DefaultValidator));
        map.insert("auto-commit".to_owned(), Arc::new(AutoCommitValidator));
        RwLock::new(map)
    });

/// Register a validator under a name for use from configuration files.
pub fn register_validator(name: impl Into<String>, validator: Arc<dyn ConnectionValidator>) {
    VALIDATORS.write().insert(name.into(), validator);
}

/// Look up a validator by its registered name.
pub fn validator_by_name(name: &str) -> Option<Arc<dyn ConnectionValidator>> {
    VALIDATORS.read().get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_validators_are_registered() {
        assert!(validator_by_name("default").is_some());
        assert!(validator_by_name("auto-commit").is_some());
        assert!(validator_by_name("missing").is_none());
    }
}
