//! Error types for the PostgreSQL client.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

use super::result::QueryResult;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Coarse classification of a [`PgError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport, TLS or authentication failure. The connection is unusable.
    Connection,
    /// Malformed frame or unexpected message sequence. The connection is unusable.
    Protocol,
    /// Server-reported SQLSTATE. The connection stays usable.
    Query,
    /// Stale large-object handle or COPY/command sequencing misuse.
    Resource,
}

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Could not establish the connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS negotiation or handshake failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error for a command.
    #[error("{error}")]
    Query {
        error: Box<DbError>,
        /// The error result as it was materialized, if any.
        result: Option<Box<QueryResult>>,
    },

    /// Server rejected a large-object function call.
    #[error("{0}")]
    LargeObject(Box<DbError>),

    /// Operation not valid in the current connection state.
    #[error("{0}")]
    Resource(String),

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// Invalid connection parameters.
    #[error("Invalid connection option: {0}")]
    Config(String),

    /// Connection is closed or in invalid state.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Timeout waiting for response.
    #[error("Operation timed out")]
    Timeout,
}

impl PgError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PgError::Io(_)
            | PgError::Connection(_)
            | PgError::Tls(_)
            | PgError::Auth(_)
            | PgError::Config(_)
            | PgError::ConnectionClosed
            | PgError::Timeout => ErrorKind::Connection,
            PgError::Protocol(_) => ErrorKind::Protocol,
            PgError::Query { .. } | PgError::Type(_) => ErrorKind::Query,
            PgError::LargeObject(_) | PgError::Resource(_) => ErrorKind::Resource,
        }
    }

    /// Whether the connection that produced this error is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Protocol)
    }

    /// The server error behind this error, if the server reported one.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            PgError::Query { error, .. } | PgError::LargeObject(error) => Some(error),
            _ => None,
        }
    }

    /// Five-character SQLSTATE code reported by the server.
    pub fn sqlstate(&self) -> Option<&str> {
        self.db_error().map(|e| e.code.as_str())
    }

    /// The result that carried a server error, if one was materialized.
    pub fn result(&self) -> Option<&QueryResult> {
        match self {
            PgError::Query { result, .. } => result.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn query(error: DbError, result: Option<QueryResult>) -> Self {
        PgError::Query {
            error: Box::new(error),
            result: result.map(Box::new),
        }
    }
}

/// An ErrorResponse or NoticeResponse as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    /// Every field keyed by its protocol field type byte.
    pub fields: HashMap<u8, String>,
}

impl DbError {
    /// Build from the raw error/notice fields.
    pub fn from_fields(fields: HashMap<u8, String>) -> Self {
        // 'V' is the non-localized severity, sent by 9.6+
        let severity = fields
            .get(&b'V')
            .or_else(|| fields.get(&b'S'))
            .cloned()
            .unwrap_or_default();
        Self {
            severity,
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').cloned(),
            fields,
        }
    }

    /// Get a field by its protocol type byte (e.g. `b'W'` for context).
    pub fn field(&self, code: u8) -> Option<&str> {
        self.fields.get(&code).map(|s| s.as_str())
    }

    /// FATAL and PANIC errors terminate the backend.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_str(), "FATAL" | "PANIC")
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}
