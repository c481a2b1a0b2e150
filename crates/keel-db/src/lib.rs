//! Query execution layer for Keel.
//!
//! Provides a pooled, dialect-abstracted [`Client`] that leases
//! connections, executes statements with bound values, and manages
//! transactions (nested scopes become savepoints). The migration engine in
//! `keel-migrate` runs entirely through the primitives exported here.
//!
//! # Design decisions
//!
//! - **Dialect as an explicit interface**: everything database specific
//!   (identifier quoting, placeholder numbering, raw connection lifecycle,
//!   response shapes) lives behind [`Grammar`] and [`Dialect`]. The client
//!   never inspects the dialect beyond those traits.
//! - **`r2d2` connection pool**: the dialect's connection hooks are wired in
//!   as an r2d2 `ManageConnection`, so sizing and eviction stay the pool's
//!   business. Acquiring past the pool timeout yields a distinct
//!   [`DbError::ConnectionTimeout`].
//! - **Bindings never interpolated**: values always travel to the driver as
//!   bound parameters. Rendered SQL is produced only for diagnostics.

mod client;
mod dialect;
mod error;
mod event;
mod pool;
mod transaction;
mod value;

pub use client::{Client, Connection, Executor};
pub use dialect::sqlite::{SqliteDialect, SqliteSettings};
pub use dialect::{number_placeholders, render_sql, Dialect, Grammar, RawResponse};
pub use error::{DbError, DriverError, QueryError, TransactionAction};
pub use event::{QueryEvent, QueryListener, TracingListener};
pub use pool::PoolSettings;
pub use transaction::{Transaction, TransactionState};
pub use value::{Method, QueryResponse, Row, Statement, Value};
