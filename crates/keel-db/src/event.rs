//! Notifications emitted around statement execution.

use uuid::Uuid;

use crate::error::DbError;
use crate::value::{QueryResponse, Value};

/// One step in the life of a statement.
#[derive(Debug)]
pub enum QueryEvent<'a> {
    /// About to send a statement.
    Query {
        /// Connection the statement runs on.
        connection: Uuid,
        /// Enclosing transaction, if any.
        transaction: Option<&'a str>,
        /// SQL as sent to the driver.
        sql: &'a str,
        /// Bound values.
        bindings: &'a [Value],
    },
    /// The statement succeeded.
    Response {
        connection: Uuid,
        transaction: Option<&'a str>,
        sql: &'a str,
        response: &'a QueryResponse,
    },
    /// The statement failed. Emitted before the error is returned.
    Error {
        connection: Uuid,
        transaction: Option<&'a str>,
        sql: &'a str,
        error: &'a DbError,
    },
}

/// Receives [`QueryEvent`]s from a client.
///
/// Listeners run inline on the executing thread and must not block.
pub trait QueryListener: Send + Sync {
    fn on_event(&self, event: &QueryEvent<'_>);
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl QueryListener for TracingListener {
    fn on_event(&self, event: &QueryEvent<'_>) {
        match event {
            QueryEvent::Query {
                connection,
                transaction,
                sql,
                bindings,
            } => tracing::debug!(
                %connection,
                transaction = transaction.unwrap_or("-"),
                sql,
                bindings = bindings.len(),
                "query"
            ),
            QueryEvent::Response {
                connection,
                transaction,
                response,
                ..
            } => tracing::trace!(
                %connection,
                transaction = transaction.unwrap_or("-"),
                affected = response.affected(),
                "query response"
            ),
            QueryEvent::Error {
                connection,
                transaction,
                error,
                ..
            } => tracing::debug!(
                %connection,
                transaction = transaction.unwrap_or("-"),
                error = %error,
                "query error"
            ),
        }
    }
}
