//! Transactions and savepoints.

use std::fmt;

use crate::client::{Connection, Executor};
use crate::dialect::{Dialect, Grammar};
use crate::error::{DbError, TransactionAction};
use crate::value::{QueryResponse, Statement};

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

/// An open transaction, or a savepoint nested inside one.
///
/// Owns its connection for its whole lifetime. Dropping a transaction that
/// was neither committed nor rolled back rolls it back, so early returns
/// and panics never leave a connection mid-transaction.
pub struct Transaction<'c, D: Dialect> {
    conn: &'c mut Connection<D>,
    id: String,
    /// Id of the top-level transaction; savepoint names derive from it.
    root: String,
    depth: u32,
    state: TransactionState,
}

impl<D: Dialect> fmt::Debug for Transaction<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection", &self.conn.id())
            .field("depth", &self.depth)
            .field("state", &self.state)
            .finish()
    }
}

fn abort(transaction: &str, action: TransactionAction, source: DbError) -> DbError {
    DbError::TransactionAbort {
        transaction: transaction.to_string(),
        action,
        source: Box::new(source),
    }
}

impl<'c, D: Dialect> Transaction<'c, D> {
    pub(crate) fn begin(conn: &'c mut Connection<D>) -> Result<Self, DbError> {
        let id = conn.core().next_transaction_id();
        let sql = conn.core().dialect.begin_transaction_sql();
        conn.execute_script_in(Some(&id), sql)
            .map_err(|err| abort(&id, TransactionAction::Begin, err))?;

        tracing::debug!(transaction = %id, connection = %conn.id(), "transaction started");
        Ok(Self {
            conn,
            root: id.clone(),
            id,
            depth: 0,
            state: TransactionState::Open,
        })
    }

    /// Transaction id. Savepoints are named `<root id>_sp<depth>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Nesting depth; zero for a top-level transaction.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Id of the connection this transaction runs on.
    pub fn connection_id(&self) -> uuid::Uuid {
        self.conn.id()
    }

    fn is_savepoint(&self) -> bool {
        self.depth > 0
    }

    /// Opens a savepoint scoped to the returned transaction.
    ///
    /// Rolling the savepoint back undoes only the work done through it.
    ///
    /// # Errors
    ///
    /// Returns `DbError::TransactionAbort` if the savepoint cannot be
    /// created.
    pub fn savepoint(&mut self) -> Result<Transaction<'_, D>, DbError> {
        let depth = self.depth + 1;
        let name = format!("{}_sp{depth}", self.root);
        let sql = self.conn.core().dialect.savepoint_sql(&name);
        self.conn
            .execute_script_in(Some(&name), &sql)
            .map_err(|err| abort(&name, TransactionAction::Begin, err))?;

        Ok(Transaction {
            conn: &mut *self.conn,
            id: name,
            root: self.root.clone(),
            depth,
            state: TransactionState::Open,
        })
    }

    /// Runs `f` in a nested scope.
    ///
    /// Uses a savepoint when the dialect supports them, otherwise runs `f`
    /// directly in this transaction.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or the `DbError` from the savepoint.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_, D>) -> Result<T, E>,
        E: From<DbError>,
    {
        if !self.conn.core().dialect.supports_savepoints() {
            return f(self);
        }

        let mut nested = self.savepoint()?;
        match f(&mut nested) {
            Ok(value) => {
                nested.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = nested.rollback() {
                    tracing::warn!(error = %rollback_err, "savepoint rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Commits the transaction, or releases the savepoint.
    ///
    /// # Errors
    ///
    /// Returns `DbError::TransactionAbort`; the transaction is then rolled
    /// back on drop.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.state = TransactionState::Committing;
        let sql = if self.is_savepoint() {
            self.conn.core().dialect.release_savepoint_sql(&self.id)
        } else {
            self.conn.core().dialect.commit_sql().to_string()
        };

        self.conn
            .execute_script_in(Some(&self.id), &sql)
            .map_err(|err| abort(&self.id, TransactionAction::Commit, err))?;

        self.state = TransactionState::Committed;
        tracing::debug!(transaction = %self.id, "transaction committed");
        Ok(())
    }

    /// Rolls the transaction back, or rolls back to the savepoint.
    ///
    /// # Errors
    ///
    /// Returns `DbError::TransactionAbort` if the rollback statement fails.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.rollback_in_place()
    }

    fn rollback_in_place(&mut self) -> Result<(), DbError> {
        self.state = TransactionState::RollingBack;
        let sql = if self.is_savepoint() {
            self.conn.core().dialect.rollback_to_savepoint_sql(&self.id)
        } else {
            self.conn.core().dialect.rollback_sql().to_string()
        };

        self.conn
            .execute_script_in(Some(&self.id), &sql)
            .map_err(|err| abort(&self.id, TransactionAction::Rollback, err))?;

        self.state = TransactionState::RolledBack;
        tracing::debug!(transaction = %self.id, "transaction rolled back");
        Ok(())
    }
}

impl<D: Dialect> Drop for Transaction<'_, D> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Open | TransactionState::Committing
        ) {
            if let Err(err) = self.rollback_in_place() {
                tracing::warn!(transaction = %self.id, error = %err, "rollback on drop failed");
            }
        }
    }
}

impl<D: Dialect> Executor for Transaction<'_, D> {
    fn execute(&mut self, statement: &Statement) -> Result<QueryResponse, DbError> {
        self.conn.execute_in(Some(&self.id), statement)
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_script_in(Some(&self.id), sql)
    }

    fn grammar(&self) -> &dyn Grammar {
        &*self.conn.core().dialect
    }

    fn transaction_id(&self) -> Option<&str> {
        Some(&self.id)
    }
}
