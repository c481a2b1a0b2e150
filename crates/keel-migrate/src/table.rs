//! Bookkeeping tables: applied migration records and the lock row.

use keel_db::{DbError, Executor, Method, QueryResponse, Row, Statement};
use serde::Serialize;

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationRecord {
    /// Insertion id; defines application order.
    pub id: i64,
    pub name: String,
    /// Batch the migration was applied in.
    pub batch: i64,
    /// When it was applied, as RFC 3339 text.
    pub applied_at: String,
}

impl MigrationRecord {
    fn from_row(row: &Row) -> Result<Self, DbError> {
        Ok(Self {
            id: row.get_i64("id")?,
            name: row.get_str("name")?.to_string(),
            batch: row.get_i64("batch")?,
            applied_at: row.get_str("migration_time")?.to_string(),
        })
    }
}

/// Names of the two bookkeeping tables.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    migrations: String,
    lock: String,
}

impl Tables {
    pub(crate) fn new(migrations: String, lock: String) -> Self {
        Self { migrations, lock }
    }

    /// Creates both tables if missing and makes sure the lock row exists.
    ///
    /// Should run inside a transaction so concurrent runners cannot both
    /// insert a lock row.
    pub(crate) fn ensure(&self, exec: &mut dyn Executor) -> Result<(), DbError> {
        let (create_migrations, create_lock, count_lock, insert_lock) = {
            let g = exec.grammar();
            let increments = g.increments_type();
            (
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({} {increments}, {} varchar(255), {} integer, {} {})",
                    g.wrap_identifier(&self.migrations),
                    g.wrap_identifier("id"),
                    g.wrap_identifier("name"),
                    g.wrap_identifier("batch"),
                    g.wrap_identifier("migration_time"),
                    g.timestamp_type(),
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} ({} {increments}, {} integer not null)",
                    g.wrap_identifier(&self.lock),
                    g.wrap_identifier("index"),
                    g.wrap_identifier("is_locked"),
                ),
                format!(
                    "SELECT COUNT(*) AS {} FROM {}",
                    g.wrap_identifier("count"),
                    g.wrap_identifier(&self.lock)
                ),
                format!(
                    "INSERT INTO {} ({}) VALUES (?)",
                    g.wrap_identifier(&self.lock),
                    g.wrap_identifier("is_locked")
                ),
            )
        };

        exec.execute(&Statement::raw(create_migrations))?;
        exec.execute(&Statement::raw(create_lock))?;

        let rows = match exec.execute(&Statement::raw(count_lock).method(Method::First))? {
            QueryResponse::Row(Some(row)) => row.get_i64("count")?,
            _ => 0,
        };
        if rows == 0 {
            tracing::debug!(table = %self.lock, "creating migration lock row");
            exec.execute(&Statement::insert(insert_lock).bind(0))?;
        }
        Ok(())
    }

    /// Whether the lock row exists, which implies both tables do.
    ///
    /// Read-only, so it never waits on another session's write lock. Any
    /// failure (typically a missing table) reads as not ready.
    pub(crate) fn is_ready(&self, exec: &mut dyn Executor) -> bool {
        let sql = {
            let g = exec.grammar();
            format!(
                "SELECT COUNT(*) AS {} FROM {}",
                g.wrap_identifier("count"),
                g.wrap_identifier(&self.lock)
            )
        };
        match exec.execute(&Statement::select(sql).method(Method::First)) {
            Ok(QueryResponse::Row(Some(row))) => row.get_i64("count").is_ok_and(|n| n > 0),
            _ => false,
        }
    }

    /// Applied records, in insertion order.
    pub(crate) fn list_applied(&self, exec: &mut dyn Executor) -> Result<Vec<MigrationRecord>, DbError> {
        let sql = {
            let g = exec.grammar();
            format!(
                "SELECT {}, {}, {}, {} FROM {} ORDER BY {} ASC",
                g.wrap_identifier("id"),
                g.wrap_identifier("name"),
                g.wrap_identifier("batch"),
                g.wrap_identifier("migration_time"),
                g.wrap_identifier(&self.migrations),
                g.wrap_identifier("id"),
            )
        };

        exec.execute(&Statement::select(sql))?
            .into_rows()
            .into_iter()
            .map(|row| MigrationRecord::from_row(&row))
            .collect()
    }

    pub(crate) fn insert_record(
        &self,
        exec: &mut dyn Executor,
        name: &str,
        batch: i64,
    ) -> Result<(), DbError> {
        let sql = {
            let g = exec.grammar();
            format!(
                "INSERT INTO {} ({}, {}, {}) VALUES (?, ?, ?)",
                g.wrap_identifier(&self.migrations),
                g.wrap_identifier("name"),
                g.wrap_identifier("batch"),
                g.wrap_identifier("migration_time"),
            )
        };
        let applied_at = chrono::Utc::now().to_rfc3339();
        exec.execute(
            &Statement::insert(sql)
                .bind(name)
                .bind(batch)
                .bind(applied_at),
        )?;
        Ok(())
    }

    pub(crate) fn delete_record(&self, exec: &mut dyn Executor, name: &str) -> Result<(), DbError> {
        let sql = {
            let g = exec.grammar();
            format!(
                "DELETE FROM {} WHERE {} = ?",
                g.wrap_identifier(&self.migrations),
                g.wrap_identifier("name"),
            )
        };
        exec.execute(&Statement::delete(sql).bind(name))?;
        Ok(())
    }
}
