//! Driver abstraction and process-wide driver registry.
//!
//! The pool treats the database driver as an external collaborator:
//! these traits describe the raw session surface the pooling and
//! caching layers need, and nothing more. Statement execution methods
//! are deliberately thin pass-throughs.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::decoder::SecureString;
use crate::error::{DbError, Result};
use crate::mode::StatementMode;

/// Credentials and pass-through properties for opening a session.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Login user, if any.
    pub user: Option<String>,
    /// Login password, if any.
    pub password: Option<SecureString>,
    /// Driver-specific pass-through properties.
    pub properties: BTreeMap<String, String>,
}

impl ConnectOptions {
    /// Build options from a flat property bag. The `user` and
    /// `password` keys are lifted out of the bag into their fields;
    /// everything else passes through.
    #[must_use]
    pub fn from_properties(mut properties: BTreeMap<String, String>) -> Self {
        let user = properties.remove("user");
        let password = properties.remove("password").map(SecureString::new);
        Self {
            user,
            password,
            properties,
        }
    }
}

/// A minimal column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

/// A row of values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Build a row from values.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// The value at `index`, if present.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Key-retrieval request for prepared statements that need generated
/// keys or explicit column lists. Statements created this way are
/// never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyedRequest {
    /// Return auto-generated keys.
    GeneratedKeys,
    /// Return the given columns by index.
    ColumnIndexes(Vec<usize>),
    /// Return the given columns by name.
    ColumnNames(Vec<String>),
}

/// A raw database session as opened by a driver.
///
/// Implementations use interior mutability; the pooling layer
/// guarantees single-borrower access between check-out and check-in.
pub trait RawConnection: Send + Sync {
    /// Create a simple statement with the given mode.
    fn create_statement(&self, mode: StatementMode) -> Result<Box<dyn RawStatement>>;

    /// Prepare a statement for the given SQL and mode.
    fn prepare_statement(
        &self,
        sql: &str,
        mode: StatementMode,
    ) -> Result<Box<dyn RawPreparedStatement>>;

    /// Prepare a stored-procedure call for the given SQL and mode.
    fn prepare_call(
        &self,
        sql: &str,
        mode: StatementMode,
    ) -> Result<Box<dyn RawCallableStatement>>;

    /// Prepare a statement that reports generated keys or explicit
    /// columns.
    fn prepare_statement_keyed(
        &self,
        sql: &str,
        request: KeyedRequest,
    ) -> Result<Box<dyn RawPreparedStatement>>;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> Result<bool>;

    /// Switch auto-commit on or off.
    fn set_auto_commit(&self, enabled: bool) -> Result<()>;

    /// Commit the open transaction.
    fn commit(&self) -> Result<()>;

    /// Roll back the open transaction.
    fn rollback(&self) -> Result<()>;

    /// Drain and return any pending warnings.
    fn take_warnings(&self) -> Vec<String>;

    /// Discard pending warnings.
    fn clear_warnings(&self) -> Result<()>;

    /// Clear the session's custom type map.
    fn clear_type_map(&self) -> Result<()>;

    /// Whether the session has been closed.
    fn is_closed(&self) -> bool;

    /// Close the session. Closing twice is allowed.
    fn close(&self) -> Result<()>;
}

/// A raw simple statement.
pub trait RawStatement: Send + Sync {
    /// The mode the statement was created with.
    fn mode(&self) -> StatementMode;

    /// Execute an update, returning the affected-row count.
    fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a query, returning its rows.
    fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Close any result set still open from a previous execution.
    fn close_results(&self) -> Result<()>;

    /// Discard pending warnings.
    fn clear_warnings(&self) -> Result<()>;

    /// Discard any batched commands.
    fn clear_batch(&self) -> Result<()>;

    /// Close the statement. Closing twice is allowed.
    fn close(&self) -> Result<()>;
}

/// A raw prepared statement.
pub trait RawPreparedStatement: RawStatement {
    /// Bind a parameter by 1-based index.
    fn bind(&self, index: usize, value: Value) -> Result<()>;

    /// Clear all bound parameters.
    fn clear_parameters(&self) -> Result<()>;

    /// Execute the prepared update.
    fn execute_prepared(&self) -> Result<u64>;

    /// Execute the prepared query.
    fn query_prepared(&self) -> Result<Vec<Row>>;
}

/// A raw stored-procedure call.
pub trait RawCallableStatement: RawPreparedStatement {
    /// Register a 1-based parameter index as an out-parameter.
    fn register_out_param(&self, index: usize) -> Result<()>;

    /// Read an out-parameter after execution.
    fn out_value(&self, index: usize) -> Result<Value>;
}

/// A database driver capable of opening raw sessions.
pub trait Driver: Send + Sync {
    /// Short registry name, e.g. `"memory"`.
    fn name(&self) -> &str;

    /// Whether this driver understands the URL.
    fn accepts_url(&self, url: &str) -> bool;

    /// Open a new session.
    fn connect(&self, url: &str, options: &ConnectOptions) -> Result<Box<dyn RawConnection>>;
}

static DRIVERS: Lazy<DashMap<String, Arc<dyn Driver>>> = Lazy::new(DashMap::new);

/// Register a driver under its own name, replacing any driver already
/// registered under that name.
pub fn register_driver(driver: Arc<dyn Driver>) {
    DRIVERS.insert(driver.name().to_owned(), driver);
}

/// Remove a driver from the registry.
pub fn deregister_driver(name: &str) -> bool {
    DRIVERS.remove(name).is_some()
}

/// Whether a driver is registered under `name`.
pub fn driver_registered(name: &str) -> bool {
    DRIVERS.contains_key(name)
}

/// Open a session through the first registered driver that accepts
/// the URL.
pub fn connect(url: &str, options: &ConnectOptions) -> Result<Box<dyn RawConnection>> {
    let driver = DRIVERS
        .iter()
        .find(|entry| entry.value().accepts_url(url))
        .map(|entry| Arc::clone(entry.value()));
    match driver {
        Some(driver) => driver.connect(url, options),
        None => Err(DbError::NoDriver {
            url: url.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_options_lift_credentials_from_bag() {
        let mut bag = BTreeMap::new();
        bag.insert("user".to_owned(), "scott".to_owned());
        bag.insert("password".to_owned(), "tiger".to_owned());
        bag.insert("ssl".to_owned(), "true".to_owned());
        let options = ConnectOptions::from_properties(bag);
        assert_eq!(options.user.as_deref(), Some("scott"));
        assert_eq!(options.password.as_ref().map(|p| p.expose()), Some("tiger"));
        assert_eq!(options.properties.get("ssl").map(String::as_str), Some("true"));
        assert!(!options.properties.contains_key("password"));
    }

    #[test]
    fn connect_without_driver_reports_no_driver() {
        let result = connect("nosuch:db", &ConnectOptions::default());
        assert!(matches!(result, Err(DbError::NoDriver { .. })));
    }
}
