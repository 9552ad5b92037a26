//! Result-set mode triple for statements.
//!
//! Two statements over the same SQL are only interchangeable in the
//! cache when their full mode triples are equal.

/// How a statement's result set can be traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultSetKind {
    /// Cursor moves forward only. The default.
    #[default]
    ForwardOnly,
    /// Scrollable, insensitive to concurrent changes.
    ScrollInsensitive,
    /// Scrollable, sensitive to concurrent changes.
    ScrollSensitive,
}

/// Whether a result set can be updated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Concurrency {
    /// Read-only result set. The default.
    #[default]
    ReadOnly,
    /// Updatable result set.
    Updatable,
}

/// Whether cursors survive a transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Holdability {
    /// Cursors stay open across commit. The default.
    #[default]
    HoldOverCommit,
    /// Cursors close at commit.
    CloseAtCommit,
}

/// The `(kind, concurrency, holdability)` triple a statement was
/// created with. Cache lookups match on the whole triple, never on
/// SQL alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatementMode {
    /// Result-set traversal kind.
    pub kind: ResultSetKind,
    /// Result-set concurrency.
    pub concurrency: Concurrency,
    /// Cursor holdability across commit.
    pub holdability: Holdability,
}

impl StatementMode {
    /// A mode with the given kind and default concurrency/holdability.
    #[must_use]
    pub fn with_kind(kind: ResultSetKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }
}
