//! Prepared statement bookkeeping.
//!
//! This module provides:
//! - `PreparedStatement`: a server-side statement as last described by the server
//! - `StatementCache`: the statements known to exist on one connection, by name

use std::collections::HashMap;
use std::sync::Arc;

use super::protocol::FieldDescription;
use super::types::Oid;

/// Shared column descriptions, handed to every result of a statement without copying.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

// ============================================================================
// Prepared Statement
// ============================================================================

/// A prepared statement that has been parsed by PostgreSQL.
///
/// Prepared statements are created via the Parse message and can be
/// executed multiple times with different parameters via Bind + Execute.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name; empty for the unnamed statement
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result column descriptions (from RowDescription)
    pub columns: SharedColumns,
}

impl PreparedStatement {
    /// Create a new prepared statement.
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    /// Set the parameter types after receiving ParameterDescription.
    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    /// Set the column descriptions after receiving RowDescription.
    pub fn set_columns(&mut self, columns: SharedColumns) {
        self.columns = columns;
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Whether this is the unnamed statement, which any Parse may replace.
    pub fn is_unnamed(&self) -> bool {
        self.name.is_empty()
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

/// Statements prepared on one connection.
///
/// The server stays the authority on which names exist: duplicate and
/// unknown names are reported by it, not rejected here. The cache records
/// what a successful prepare or describe returned so later executions know
/// the parameter types, and forgets entries on close or connection loss.
#[derive(Debug, Default)]
pub struct StatementCache {
    statements: HashMap<String, Arc<PreparedStatement>>,
}

impl StatementCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a statement by name. The Arc clone is a reference count increment.
    pub fn get(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.get(name).map(Arc::clone)
    }

    /// Check if a statement name is known (without cloning).
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.statements.contains_key(name)
    }

    /// Record a statement, replacing any previous entry of the same name.
    ///
    /// Returns the replaced entry. Only the unnamed statement is ever
    /// replaced in practice, since the server refuses duplicate names.
    pub fn insert(&mut self, statement: PreparedStatement) -> Option<Arc<PreparedStatement>> {
        self.statements
            .insert(statement.name.clone(), Arc::new(statement))
    }

    /// Forget a statement.
    pub fn remove(&mut self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.statements.remove(name)
    }

    /// Get the number of known statements.
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Forget every statement.
    ///
    /// Note: This does NOT close the statements on the server.
    pub fn clear(&mut self) {
        self.statements.clear();
    }

    /// Names of all known statements, sorted.
    pub fn statement_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.statements.keys().cloned().collect();
        names.sort();
        names
    }
}
