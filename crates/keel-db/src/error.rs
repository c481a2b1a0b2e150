//! Error types for the query execution layer.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::value::Value;

/// An error raised by a dialect's underlying driver.
///
/// The original error is kept intact behind the box so callers can
/// recover its concrete type with [`DriverError::downcast_ref`].
pub struct DriverError(Box<dyn StdError + Send + Sync + 'static>);

impl DriverError {
    /// Wraps a driver error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Box::new(error))
    }

    /// Builds a driver error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into().into())
    }

    /// Returns the original driver error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Borrows the original driver error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for DriverError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// A statement failed inside the driver.
///
/// Carries the driver error untouched plus the statement as it was sent
/// and a rendered form with the bindings substituted in, for diagnostics.
#[derive(Debug, Error)]
#[error("{rendered} - {source}")]
pub struct QueryError {
    /// The driver error.
    #[source]
    pub source: DriverError,
    /// SQL text as sent to the driver, placeholders intact.
    pub sql: String,
    /// Values bound to the statement.
    pub bindings: Vec<Value>,
    /// SQL with bindings substituted as escaped literals. Never executed.
    pub rendered: String,
}

/// Which transaction boundary failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAction {
    /// Starting the transaction or savepoint.
    Begin,
    /// Committing or releasing a savepoint.
    Commit,
    /// Rolling back.
    Rollback,
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "begin",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        })
    }
}

/// Errors returned by the query execution layer.
#[derive(Debug, Error)]
pub enum DbError {
    /// The pool did not yield a connection within its timeout.
    #[error("timed out after {waited:?} waiting for a pooled connection: {reason}")]
    ConnectionTimeout {
        /// The configured acquisition timeout.
        waited: Duration,
        /// The pool's explanation, usually the last connect failure.
        reason: String,
    },

    /// A statement failed to execute.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// A transaction could not begin, commit, or roll back cleanly.
    #[error("transaction {transaction} failed to {action}: {source}")]
    TransactionAbort {
        /// Transaction id (or savepoint name).
        transaction: String,
        /// The boundary that failed.
        action: TransactionAction,
        /// The underlying failure.
        #[source]
        source: Box<DbError>,
    },

    /// The pool could not be built.
    #[error("failed to create connection pool: {0}")]
    Pool(#[source] r2d2::Error),

    /// A driver operation outside statement execution failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A column value did not have the expected type.
    #[error("column '{column}' could not be read as {expected}")]
    Decode {
        /// Column name.
        column: String,
        /// Expected type name.
        expected: &'static str,
    },
}

impl DbError {
    /// Returns the statement failure, looking through transaction aborts.
    pub fn as_query_error(&self) -> Option<&QueryError> {
        match self {
            Self::Query(err) => Some(err),
            Self::TransactionAbort { source, .. } => source.as_query_error(),
            _ => None,
        }
    }

    /// Returns the driver error at the root of this failure, looking through
    /// transaction aborts.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::Query(err) => Some(&err.source),
            Self::Driver(err) => Some(err),
            Self::TransactionAbort { source, .. } => source.driver_error(),
            _ => None,
        }
    }

    /// Returns `true` if this is a pool acquisition timeout.
    pub fn is_connection_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout { .. })
    }
}
