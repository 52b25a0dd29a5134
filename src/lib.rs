//! pgcore - a PostgreSQL wire-protocol client core.
//!
//! ```no_run
//! # async fn demo() -> pgcore::PgResult<()> {
//! use pgcore::{Format, PgConnection, PgValue};
//!
//! let mut conn = PgConnection::connect("postgresql://postgres@localhost/postgres").await?;
//! conn.prepare("by_id", "SELECT name FROM users WHERE id = $1", &[]).await?;
//! let result = conn
//!     .exec_prepared("by_id", &[PgValue::Int4(1)], Format::Text)
//!     .await?;
//! println!("{:?}", result.get_str(0, 0));
//! # Ok(())
//! # }
//! ```

pub mod pg;

pub use pg::escape::{
    escape_bytea, escape_identifier, escape_literal, escape_string, quote_ident,
    quote_qualified, standard_conforming_strings, unescape_bytea,
};
pub use pg::*;
