//! The client: pooled connections and annotated statement execution.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use uuid::Uuid;

use crate::dialect::{render_sql, Dialect, Grammar};
use crate::error::{DbError, QueryError};
use crate::event::{QueryEvent, QueryListener};
use crate::pool::{build_pool, DialectManager, PoolSettings};
use crate::transaction::Transaction;
use crate::value::{QueryResponse, Statement};

/// Something statements can be executed against: a bare [`Connection`] or
/// an open [`Transaction`].
///
/// Migration code is written against `&mut dyn Executor` so it does not
/// care which one it was handed.
pub trait Executor {
    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` when the driver rejects the statement.
    fn execute(&mut self, statement: &Statement) -> Result<QueryResponse, DbError>;

    /// Executes a multi-statement script with no bindings.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` when the driver rejects the script.
    fn execute_script(&mut self, sql: &str) -> Result<(), DbError>;

    /// The dialect's text rules.
    fn grammar(&self) -> &dyn Grammar;

    /// Id of the enclosing transaction, if any.
    fn transaction_id(&self) -> Option<&str>;
}

/// State shared by a client and every connection it lends.
pub(crate) struct Core<D> {
    pub(crate) dialect: Arc<D>,
    listeners: Vec<Arc<dyn QueryListener>>,
    next_transaction: AtomicU64,
}

impl<D: Dialect> Core<D> {
    pub(crate) fn next_transaction_id(&self) -> String {
        let n = self.next_transaction.fetch_add(1, Ordering::Relaxed) + 1;
        format!("trx{n}")
    }

    fn emit(&self, event: &QueryEvent<'_>) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    /// Runs a statement on `raw`, emitting events and annotating failures.
    pub(crate) fn execute(
        &self,
        connection: Uuid,
        transaction: Option<&str>,
        raw: &mut D::Raw,
        statement: &Statement,
    ) -> Result<QueryResponse, DbError> {
        let sql = self.dialect.position_bindings(&statement.sql);
        self.emit(&QueryEvent::Query {
            connection,
            transaction,
            sql: &sql,
            bindings: &statement.bindings,
        });

        match self
            .dialect
            .query(raw, &sql, &statement.bindings, &statement.method)
        {
            Ok(raw_response) => {
                let response = self
                    .dialect
                    .process_response(&statement.method, raw_response);
                self.emit(&QueryEvent::Response {
                    connection,
                    transaction,
                    sql: &sql,
                    response: &response,
                });
                Ok(response)
            }
            Err(source) => {
                let rendered =
                    render_sql(&*self.dialect, &statement.sql, &statement.bindings);
                let error = DbError::Query(QueryError {
                    source,
                    sql: sql.clone(),
                    bindings: statement.bindings.clone(),
                    rendered,
                });
                self.emit(&QueryEvent::Error {
                    connection,
                    transaction,
                    sql: &sql,
                    error: &error,
                });
                Err(error)
            }
        }
    }

    pub(crate) fn execute_script(
        &self,
        connection: Uuid,
        transaction: Option<&str>,
        raw: &mut D::Raw,
        sql: &str,
    ) -> Result<(), DbError> {
        self.emit(&QueryEvent::Query {
            connection,
            transaction,
            sql,
            bindings: &[],
        });

        self.dialect.execute_script(raw, sql).map_err(|source| {
            let error = DbError::Query(QueryError {
                source,
                sql: sql.to_string(),
                bindings: Vec::new(),
                rendered: sql.to_string(),
            });
            self.emit(&QueryEvent::Error {
                connection,
                transaction,
                sql,
                error: &error,
            });
            error
        })
    }
}

/// A pooled, dialect-aware database client.
///
/// Cloning is cheap; clones share the pool.
pub struct Client<D: Dialect> {
    pool: Pool<DialectManager<D>>,
    core: Arc<Core<D>>,
    settings: PoolSettings,
}

impl<D: Dialect> Clone for Client<D> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            core: Arc::clone(&self.core),
            settings: self.settings,
        }
    }
}

impl<D: Dialect> fmt::Debug for Client<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("dialect", &self.core.dialect.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<D: Dialect> Client<D> {
    /// Creates a client with no listeners.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if the pool cannot be built.
    pub fn new(dialect: D, settings: PoolSettings) -> Result<Self, DbError> {
        Self::with_listeners(dialect, settings, Vec::new())
    }

    /// Creates a client delivering query events to `listeners`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Pool` if the pool cannot be built.
    pub fn with_listeners(
        dialect: D,
        settings: PoolSettings,
        listeners: Vec<Arc<dyn QueryListener>>,
    ) -> Result<Self, DbError> {
        let dialect = Arc::new(dialect);
        let pool = build_pool(Arc::clone(&dialect), settings)?;
        Ok(Self {
            pool,
            core: Arc::new(Core {
                dialect,
                listeners,
                next_transaction: AtomicU64::new(0),
            }),
            settings,
        })
    }

    /// The dialect's text rules.
    pub fn grammar(&self) -> &dyn Grammar {
        &*self.core.dialect
    }

    /// Leases a connection from the pool.
    ///
    /// Blocks up to the configured connection timeout. Never retries.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConnectionTimeout` if no connection became
    /// available in time.
    pub fn acquire(&self) -> Result<Connection<D>, DbError> {
        let raw = self.pool.get().map_err(|err| DbError::ConnectionTimeout {
            waited: self.settings.connection_timeout,
            reason: err.to_string(),
        })?;
        let conn = Connection {
            id: Uuid::new_v4(),
            raw,
            core: Arc::clone(&self.core),
        };
        tracing::trace!(connection = %conn.id, "acquired connection");
        Ok(conn)
    }

    /// Returns a connection to the pool.
    ///
    /// Equivalent to dropping it. Taking the connection by value makes a
    /// second release impossible.
    pub fn release(&self, conn: Connection<D>) {
        tracing::trace!(connection = %conn.id, "released connection");
        drop(conn);
    }

    /// Executes a statement on `conn`.
    ///
    /// On failure the returned `DbError::Query` keeps the driver's error
    /// as its source and carries the statement rendered with its bindings.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` when the driver rejects the statement.
    pub fn execute(
        &self,
        conn: &mut Connection<D>,
        statement: &Statement,
    ) -> Result<QueryResponse, DbError> {
        conn.execute(statement)
    }

    /// Executes a statement on a connection leased just for it.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConnectionTimeout` or `DbError::Query`.
    pub fn run(&self, statement: &Statement) -> Result<QueryResponse, DbError> {
        let mut conn = self.acquire()?;
        conn.execute(statement)
    }

    /// Opens a transaction on `conn`.
    ///
    /// The transaction rolls back when dropped unless committed.
    ///
    /// # Errors
    ///
    /// Returns `DbError::TransactionAbort` if the transaction cannot begin.
    pub fn begin<'c>(&self, conn: &'c mut Connection<D>) -> Result<Transaction<'c, D>, DbError> {
        Transaction::begin(conn)
    }

    /// Runs `f` inside a transaction on a freshly leased connection.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err` (or
    /// panics), and releases the connection on every path.
    ///
    /// # Errors
    ///
    /// Returns whatever `f` returns, or the `DbError` from acquiring,
    /// beginning, or committing.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_, D>) -> Result<T, E>,
        E: From<DbError>,
    {
        let mut conn = self.acquire()?;
        let mut trx = Transaction::begin(&mut conn)?;
        match f(&mut trx) {
            Ok(value) => {
                trx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = trx.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed transaction body also failed");
                }
                Err(err)
            }
        }
    }

    /// Runs `f` in `outer` when given, else in a new transaction.
    ///
    /// An outer transaction is reused as-is: no savepoint, no commit.
    ///
    /// # Errors
    ///
    /// As [`Client::transaction`].
    pub fn transaction_with<T, E, F>(
        &self,
        outer: Option<&mut Transaction<'_, D>>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_, D>) -> Result<T, E>,
        E: From<DbError>,
    {
        match outer {
            Some(trx) => f(trx),
            None => self.transaction(f),
        }
    }

    /// Whether `err` means the database was locked by another session for
    /// longer than the driver was willing to wait.
    pub fn is_busy(&self, err: &DbError) -> bool {
        err.driver_error()
            .is_some_and(|driver| self.core.dialect.is_busy(driver))
    }

    /// Number of live and idle connections in the pool.
    pub fn pool_state(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

/// A leased database session.
///
/// Returned to the pool when dropped.
pub struct Connection<D: Dialect> {
    id: Uuid,
    raw: PooledConnection<DialectManager<D>>,
    core: Arc<Core<D>>,
}

impl<D: Dialect> fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

impl<D: Dialect> Connection<D> {
    /// Unique id, for diagnostics.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn core(&self) -> &Arc<Core<D>> {
        &self.core
    }

    pub(crate) fn execute_in(
        &mut self,
        transaction: Option<&str>,
        statement: &Statement,
    ) -> Result<QueryResponse, DbError> {
        self.core.execute(self.id, transaction, &mut self.raw, statement)
    }

    pub(crate) fn execute_script_in(
        &mut self,
        transaction: Option<&str>,
        sql: &str,
    ) -> Result<(), DbError> {
        self.core
            .execute_script(self.id, transaction, &mut self.raw, sql)
    }
}

impl<D: Dialect> Executor for Connection<D> {
    fn execute(&mut self, statement: &Statement) -> Result<QueryResponse, DbError> {
        self.execute_in(None, statement)
    }

    fn execute_script(&mut self, sql: &str) -> Result<(), DbError> {
        self.execute_script_in(None, sql)
    }

    fn grammar(&self) -> &dyn Grammar {
        &*self.core.dialect
    }

    fn transaction_id(&self) -> Option<&str> {
        None
    }
}
