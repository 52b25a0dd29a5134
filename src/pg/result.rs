//! Materialized query results.
//!
//! A [`QueryResult`] is built from the RowDescription, DataRow and
//! CommandComplete/ErrorResponse frames of one statement and is immutable
//! once handed to the caller.

use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;

use super::error::{DbError, PgError, PgResult};
use super::protocol::{FieldDescription, Format};
use super::statement::SharedColumns;
use super::types::{Oid, PgValue};

/// One row: a nullable raw value per column. Most rows fit inline.
pub type Row = SmallVec<[Option<Bytes>; 8]>;

/// Status of a result, named after the libpq constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The query string was empty.
    EmptyQuery,
    /// A command that returns no rows completed.
    CommandOk,
    /// A query returned rows (possibly zero of them).
    TuplesOk,
    /// The server is ready to send COPY data.
    CopyOut,
    /// The server is ready to receive COPY data.
    CopyIn,
    /// The server's response was not understood.
    BadResponse,
    /// A notice or warning was returned.
    NonfatalError,
    /// The command failed.
    FatalError,
}

impl ResultStatus {
    /// The libpq name of this status, e.g. `PGRES_TUPLES_OK`.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::EmptyQuery => "PGRES_EMPTY_QUERY",
            ResultStatus::CommandOk => "PGRES_COMMAND_OK",
            ResultStatus::TuplesOk => "PGRES_TUPLES_OK",
            ResultStatus::CopyOut => "PGRES_COPY_OUT",
            ResultStatus::CopyIn => "PGRES_COPY_IN",
            ResultStatus::BadResponse => "PGRES_BAD_RESPONSE",
            ResultStatus::NonfatalError => "PGRES_NONFATAL_ERROR",
            ResultStatus::FatalError => "PGRES_FATAL_ERROR",
        }
    }

    /// Whether this status reports a failed command.
    pub fn is_error(self) -> bool {
        matches!(self, ResultStatus::BadResponse | ResultStatus::FatalError)
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    status: ResultStatus,
    columns: SharedColumns,
    rows: Vec<Row>,
    command_tag: String,
    error: Option<DbError>,
    param_types: Vec<Oid>,
}

impl QueryResult {
    pub(crate) fn with_status(status: ResultStatus) -> Self {
        Self {
            status,
            columns: Arc::new(Vec::new()),
            rows: Vec::new(),
            command_tag: String::new(),
            error: None,
            param_types: Vec::new(),
        }
    }

    /// Result status.
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Turn an error result into `Err`, carrying the result along.
    pub fn check(self) -> PgResult<Self> {
        if !self.status.is_error() {
            return Ok(self);
        }
        let error = self.error.clone().unwrap_or_else(|| {
            let mut fields = std::collections::HashMap::new();
            fields.insert(b'S', "ERROR".to_string());
            fields.insert(b'M', "server sent an unexpected response".to_string());
            DbError::from_fields(fields)
        });
        Err(PgError::query(error, Some(self)))
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Number of columns.
    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    /// Column descriptions.
    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    /// Column names in order.
    pub fn fields(&self) -> Vec<&str> {
        self.columns.iter().map(|f| f.name.as_str()).collect()
    }

    /// Name of column `col`.
    pub fn fname(&self, col: usize) -> Option<&str> {
        self.columns.get(col).map(|f| f.name.as_str())
    }

    /// Index of the column named `name`.
    ///
    /// Unquoted names match case-insensitively; a double-quoted name must
    /// match exactly.
    pub fn fnumber(&self, name: &str) -> Option<usize> {
        if let Some(quoted) = name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
            let exact = quoted.replace("\"\"", "\"");
            return self.columns.iter().position(|f| f.name == exact);
        }
        let lower = name.to_lowercase();
        self.columns.iter().position(|f| f.name == lower)
    }

    /// Type OID of column `col`.
    pub fn ftype(&self, col: usize) -> Option<Oid> {
        self.columns.get(col).map(|f| f.type_oid)
    }

    /// Wire format of column `col`.
    pub fn fformat(&self, col: usize) -> Option<Format> {
        self.columns.get(col).map(|f| f.format)
    }

    /// Type modifier of column `col` (-1 when not applicable).
    pub fn fmod(&self, col: usize) -> Option<i32> {
        self.columns.get(col).map(|f| f.type_modifier)
    }

    /// Server-side storage size of column `col`'s type (negative for variable size).
    pub fn fsize(&self, col: usize) -> Option<i16> {
        self.columns.get(col).map(|f| f.type_size)
    }

    /// OID of the table column `col` was fetched from, if any.
    pub fn ftable(&self, col: usize) -> Option<Oid> {
        self.columns.get(col).map(|f| f.table_oid)
    }

    /// Attribute number of column `col` within its table (0 if not a table column).
    pub fn ftablecol(&self, col: usize) -> Option<i16> {
        self.columns.get(col).map(|f| f.column_attr)
    }

    /// Whether every column is in binary format.
    pub fn binary_tuples(&self) -> bool {
        !self.columns.is_empty() && self.columns.iter().all(|f| f.format == Format::Binary)
    }

    // ------------------------------------------------------------------------
    // Rows
    // ------------------------------------------------------------------------

    /// Number of rows.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// All rows.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Raw value at (`row`, `col`). `None` for SQL NULL or out of range.
    pub fn getvalue(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .and_then(|v| v.as_deref())
    }

    /// Whether the value at (`row`, `col`) is SQL NULL.
    pub fn get_is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.rows.get(row).and_then(|r| r.get(col)), Some(None))
    }

    /// Length in bytes of the value at (`row`, `col`).
    pub fn getlength(&self, row: usize, col: usize) -> usize {
        self.getvalue(row, col).map_or(0, <[u8]>::len)
    }

    /// Value at (`row`, `col`) as text. `None` for NULL or non-UTF-8 data.
    pub fn get_str(&self, row: usize, col: usize) -> Option<&str> {
        self.getvalue(row, col)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Value at (`row`, `col`) decoded per its type and format.
    pub fn get_value(&self, row: usize, col: usize) -> PgResult<PgValue> {
        let field = self.columns.get(col).ok_or_else(|| {
            PgError::Resource(format!(
                "column number {} is out of range 0..{}",
                col,
                self.columns.len()
            ))
        })?;
        let cells = self.rows.get(row).ok_or_else(|| {
            PgError::Resource(format!(
                "row number {} is out of range 0..{}",
                row,
                self.rows.len()
            ))
        })?;
        match cells.get(col).and_then(|v| v.as_deref()) {
            None => Ok(PgValue::Null),
            Some(data) => PgValue::decode(field.type_oid, field.format, data),
        }
    }

    /// All values in column `col`, decoded.
    pub fn column_values(&self, col: usize) -> PgResult<Vec<PgValue>> {
        (0..self.rows.len())
            .map(|row| self.get_value(row, col))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Command status
    // ------------------------------------------------------------------------

    /// The CommandComplete tag, e.g. `INSERT 0 1`.
    pub fn cmd_status(&self) -> &str {
        &self.command_tag
    }

    /// Rows affected by the command, 0 for commands that don't report a count.
    pub fn cmd_tuples(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    /// OID of the inserted row for a single-row INSERT into a table with OIDs.
    pub fn oid_value(&self) -> Oid {
        match self.command_tag.split_whitespace().collect::<Vec<_>>().as_slice() {
            ["INSERT", oid, _] => Oid(oid.parse().unwrap_or(0)),
            _ => Oid::UNSPECIFIED,
        }
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    /// The server error, for error results.
    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    /// The server's error message, for error results.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// A single error field by its protocol type byte (e.g. `b'C'` for SQLSTATE).
    pub fn error_field(&self, code: u8) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.field(code))
    }

    // ------------------------------------------------------------------------
    // Describe results
    // ------------------------------------------------------------------------

    /// Number of parameters of a described statement.
    pub fn nparams(&self) -> usize {
        self.param_types.len()
    }

    /// Type of parameter `i` of a described statement.
    pub fn param_type(&self, i: usize) -> Option<Oid> {
        self.param_types.get(i).copied()
    }

    /// All parameter types of a described statement.
    pub fn param_types(&self) -> &[Oid] {
        &self.param_types
    }
}

/// Rows affected, parsed from a command tag.
fn parse_rows_affected(tag: &str) -> u64 {
    // Common formats:
    // - "INSERT 0 5" -> 5 rows
    // - "UPDATE 3" -> 3 rows
    // - "COPY 10" -> 10 rows
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MOVE", n]
        | ["FETCH", n]
        | ["COPY", n]
        | ["MERGE", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

// ============================================================================
// Result Builder
// ============================================================================

/// Accumulates the frames of one statement.
///
/// Each `finish_*` call hands out a result and resets the builder for the
/// next statement of the same query string.
#[derive(Debug, Default)]
pub(crate) struct ResultBuilder {
    columns: Option<SharedColumns>,
    rows: Vec<Row>,
    param_types: Vec<Oid>,
}

impl ResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_columns(&mut self, columns: SharedColumns) {
        self.columns = Some(columns);
    }

    pub fn columns(&self) -> Option<&SharedColumns> {
        self.columns.as_ref()
    }

    pub fn set_param_types(&mut self, types: Vec<Oid>) {
        self.param_types = types;
    }

    pub fn param_types(&self) -> &[Oid] {
        &self.param_types
    }

    /// Add a DataRow, checking it against the RowDescription.
    pub fn push_row(&mut self, values: Vec<Option<Bytes>>) -> PgResult<()> {
        let expected = self.columns.as_ref().map_or(0, |c| c.len());
        if self.columns.is_none() || values.len() != expected {
            return Err(PgError::Protocol(format!(
                "DataRow with {} columns does not match RowDescription with {}",
                values.len(),
                expected
            )));
        }
        self.rows.push(SmallVec::from_vec(values));
        Ok(())
    }

    /// CommandComplete: rows if a RowDescription was seen, else a plain command.
    pub fn finish(&mut self, tag: String) -> QueryResult {
        let status = if self.columns.is_some() {
            ResultStatus::TuplesOk
        } else {
            ResultStatus::CommandOk
        };
        let mut result = self.take(status);
        result.command_tag = tag;
        result
    }

    /// Result of a Describe or prepare: fields and parameter types, no rows.
    pub fn finish_description(&mut self) -> QueryResult {
        self.take(ResultStatus::CommandOk)
    }

    pub fn finish_empty(&mut self) -> QueryResult {
        self.take(ResultStatus::EmptyQuery)
    }

    /// ErrorResponse. Rows already received stay in the result.
    pub fn finish_error(&mut self, error: DbError) -> QueryResult {
        let mut result = self.take(ResultStatus::FatalError);
        result.error = Some(error);
        result
    }

    /// CopyInResponse/CopyOutResponse: one anonymous field per column.
    pub fn finish_copy(&mut self, status: ResultStatus, column_formats: &[Format]) -> QueryResult {
        let columns = column_formats
            .iter()
            .map(|&format| FieldDescription {
                name: String::new(),
                table_oid: Oid::UNSPECIFIED,
                column_attr: 0,
                type_oid: Oid::UNSPECIFIED,
                type_size: 0,
                type_modifier: -1,
                format,
            })
            .collect();
        self.columns = Some(Arc::new(columns));
        self.take(status)
    }

    fn take(&mut self, status: ResultStatus) -> QueryResult {
        let mut result = QueryResult::with_status(status);
        if let Some(columns) = self.columns.take() {
            result.columns = columns;
        }
        result.rows = mem::take(&mut self.rows);
        result.param_types = mem::take(&mut self.param_types);
        result
    }
}
