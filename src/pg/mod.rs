//! PostgreSQL frontend/backend protocol client.
//!
//! This module provides a PostgreSQL client core that:
//! - Speaks protocol 3.0 over TCP, TLS or Unix sockets
//! - Runs simple and extended queries, synchronously or as send/collect pairs
//! - Tracks prepared statements per connection
//! - Streams COPY data and drives large objects through function calls
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `connection`: Connection state machine and command cycle
//! - `result`: Materialized statement results
//! - `types`: PostgreSQL type encoding/decoding
//! - `statement`: Prepared statement bookkeeping
//! - `copy`, `large_object`, `cancel`: sub-protocols layered on a connection
//! - `escape`: literal, identifier and bytea quoting

pub mod protocol;
pub mod types;
pub mod config;
mod stream;
mod tls;
pub mod connection;
pub mod cancel;
pub mod copy;
pub mod large_object;
pub mod statement;
pub mod result;
pub mod escape;
mod auth;
pub mod error;
pub mod scram;

#[cfg(test)]
mod test_server;

// Public API re-exports for library consumers
pub use auth::encrypt_password;
pub use cancel::CancelHandle;
pub use config::{PgConfig, SslMode};
pub use connection::{AsyncStatus, NoticeReceiver, Notification, PgConnection};
pub use copy::CopyOutChunk;
pub use error::{DbError, ErrorKind, PgError, PgResult};
pub use large_object::{INV_READ, INV_WRITE};
pub use protocol::{Format, TransactionStatus};
pub use result::{QueryResult, ResultStatus, Row};
pub use statement::{PreparedStatement, SharedColumns, StatementCache};
pub use types::{Oid, PgValue};
