//! SQLite dialect backed by `rusqlite`.
//!
//! Transactions start with `BEGIN IMMEDIATE`, which takes the database
//! write lock up front. That makes every read inside the transaction a
//! locking read, so no `FOR UPDATE` clause is needed (or accepted).

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{ErrorCode, OpenFlags};

use super::{number_placeholders, Dialect, Grammar, RawResponse};
use crate::error::DriverError;
use crate::value::{Method, Row, Value};

/// Runtime tunables for SQLite connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteSettings {
    /// Busy timeout, in milliseconds. A writer waiting on another writer's
    /// transaction blocks this long before failing with `SQLITE_BUSY`.
    pub busy_timeout_ms: u64,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

/// The SQLite dialect.
pub struct SqliteDialect {
    manager: SqliteConnectionManager,
}

impl SqliteDialect {
    /// Creates a dialect opening connections to the database at `path`.
    ///
    /// Every connection runs in WAL mode with foreign keys enabled. Note that
    /// each connection to `:memory:` is a separate database.
    pub fn file(path: &str, settings: SqliteSettings) -> Self {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let manager = SqliteConnectionManager::file(path)
            .with_flags(flags)
            .with_init(move |conn| {
                // In-memory databases report "memory", which is fine.
                let journal_mode: String =
                    conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
                if journal_mode != "wal" && journal_mode != "memory" {
                    return Err(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                        Some(format!(
                            "failed to set WAL journal mode, got: {journal_mode}"
                        )),
                    ));
                }
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = {};",
                    settings.busy_timeout_ms
                ))
            });

        Self { manager }
    }
}

impl Grammar for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn position_bindings(&self, sql: &str) -> String {
        number_placeholders(sql, "?")
    }

    fn begin_transaction_sql(&self) -> &'static str {
        "BEGIN IMMEDIATE"
    }

    fn release_savepoint_sql(&self, name: &str) -> String {
        format!("RELEASE {}", self.wrap_identifier(name))
    }

    fn rollback_to_savepoint_sql(&self, name: &str) -> String {
        // ROLLBACK TO leaves the savepoint on the stack; release it too.
        format!(
            "ROLLBACK TO {0}; RELEASE {0}",
            self.wrap_identifier(name)
        )
    }

    fn locking_read_clause(&self) -> Option<&'static str> {
        None
    }

    fn increments_type(&self) -> &'static str {
        "integer not null primary key autoincrement"
    }

    fn timestamp_type(&self) -> &'static str {
        "datetime"
    }
}

impl Dialect for SqliteDialect {
    type Raw = rusqlite::Connection;

    fn acquire_raw_connection(&self) -> Result<Self::Raw, DriverError> {
        Ok(self.manager.connect()?)
    }

    fn destroy_raw_connection(&self, raw: Self::Raw) {
        if let Err((_, err)) = raw.close() {
            tracing::warn!(error = %err, "failed to close sqlite connection cleanly");
        }
    }

    fn validate_connection(&self, raw: &mut Self::Raw) -> Result<(), DriverError> {
        // A connection returned mid-transaction must not be lent out again.
        if !raw.is_autocommit() {
            return Err(DriverError::msg(
                "connection was returned with an open transaction",
            ));
        }
        Ok(self.manager.is_valid(raw)?)
    }

    fn query(
        &self,
        raw: &mut Self::Raw,
        sql: &str,
        bindings: &[Value],
        _method: &Method,
    ) -> Result<RawResponse, DriverError> {
        let mut stmt = raw.prepare(sql)?;
        let params = rusqlite::params_from_iter(bindings.iter());

        if stmt.column_count() == 0 {
            let changes = stmt.execute(params)?;
            return Ok(RawResponse {
                rows: Vec::new(),
                changes: changes as u64,
                last_insert_id: Some(raw.last_insert_rowid()),
            });
        }

        let readonly = stmt.readonly();
        let columns: std::sync::Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let width = columns.len();

        let mut rows = Vec::new();
        let mut cursor = stmt.query(params)?;
        while let Some(row) = cursor.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(from_value_ref(row.get_ref(idx)?));
            }
            rows.push(Row::new(columns.clone(), values));
        }
        drop(cursor);
        drop(stmt);

        Ok(RawResponse {
            rows,
            // RETURNING statements both write and produce rows.
            changes: if readonly { 0 } else { raw.changes() as u64 },
            last_insert_id: None,
        })
    }

    fn execute_script(&self, raw: &mut Self::Raw, sql: &str) -> Result<(), DriverError> {
        Ok(raw.execute_batch(sql)?)
    }

    fn is_busy(&self, error: &DriverError) -> bool {
        matches!(
            error.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(err: rusqlite::Error) -> Self {
        DriverError::new(err)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Value::Null => ValueRef::Null,
            Value::Integer(v) => ValueRef::Integer(*v),
            Value::Real(v) => ValueRef::Real(*v),
            Value::Text(v) => ValueRef::Text(v.as_bytes()),
            Value::Blob(v) => ValueRef::Blob(v),
        }))
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}
