//! Cross-process migration lock backed by a single persisted row.
//!
//! The lock is a compare-and-set on `is_locked`, done inside a transaction
//! after a locking read of the row. The database's row lock serializes
//! concurrent acquirers: exactly one observes `0` and flips it to `1`;
//! everyone else observes `1` (possibly after waiting for that commit) and
//! gets [`MigrateError::LockHeld`].

use keel_db::{Client, DbError, Dialect, Executor, Statement, Transaction, TransactionAction};

use crate::error::MigrateError;

/// Handle on the lock row in one lock table.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    table: String,
}

impl MigrationLock {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Takes the lock inside `outer`, or inside a dedicated transaction.
    ///
    /// With a dedicated transaction the flip to `1` is committed before
    /// this returns. With an outer transaction it commits (or not) with
    /// the outer one.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::LockHeld` if the row is already locked, or if
    /// another session kept the database write-locked past the driver's
    /// busy timeout so the transaction could not begin. The row is left
    /// untouched either way.
    pub fn acquire<D: Dialect>(
        &self,
        client: &Client<D>,
        outer: Option<&mut Transaction<'_, D>>,
    ) -> Result<(), MigrateError> {
        client
            .transaction_with(outer, |trx| self.acquire_in(trx))
            .map_err(|err| writer_contention(client, err))?;
        tracing::debug!(table = %self.table, "migration lock acquired");
        Ok(())
    }

    fn acquire_in(&self, exec: &mut dyn Executor) -> Result<(), MigrateError> {
        let (select, update, insert) = {
            let g = exec.grammar();
            let table = g.wrap_identifier(&self.table);
            let column = g.wrap_identifier("is_locked");
            let mut select = format!("SELECT {column} FROM {table}");
            if let Some(clause) = g.locking_read_clause() {
                select.push(' ');
                select.push_str(clause);
            }
            (
                select,
                format!("UPDATE {table} SET {column} = ? WHERE {column} = ?"),
                format!("INSERT INTO {table} ({column}) VALUES (?)"),
            )
        };

        let rows = exec.execute(&Statement::select(select))?.into_rows();
        if rows.is_empty() {
            // The row went missing; recreate it already held.
            exec.execute(&Statement::insert(insert).bind(1))?;
            return Ok(());
        }

        for row in &rows {
            if row.get_opt_i64("is_locked")? == Some(1) {
                return Err(MigrateError::LockHeld);
            }
        }

        let flipped = exec
            .execute(&Statement::update(update).bind(1).bind(0))?
            .affected();
        if flipped == 0 {
            return Err(MigrateError::LockHeld);
        }
        Ok(())
    }

    /// Clears the lock unconditionally.
    ///
    /// Runs in `outer` when given, otherwise directly on a pooled
    /// connection outside any transaction. Only call this after a
    /// successful [`acquire`](Self::acquire).
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the update fails.
    pub fn release<D: Dialect>(
        &self,
        client: &Client<D>,
        outer: Option<&mut Transaction<'_, D>>,
    ) -> Result<(), MigrateError> {
        match outer {
            Some(trx) => self.release_in(trx)?,
            None => {
                let mut conn = client.acquire()?;
                self.release_in(&mut conn)?;
            }
        }
        tracing::debug!(table = %self.table, "migration lock released");
        Ok(())
    }

    fn release_in(&self, exec: &mut dyn Executor) -> Result<(), MigrateError> {
        let sql = {
            let g = exec.grammar();
            format!(
                "UPDATE {} SET {} = ?",
                g.wrap_identifier(&self.table),
                g.wrap_identifier("is_locked")
            )
        };
        exec.execute(&Statement::update(sql).bind(0))?;
        Ok(())
    }

    /// Clears the lock without checking who holds it.
    ///
    /// Recovery path for a runner that crashed while holding the lock. It
    /// does not check whether a live runner is mid-batch.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the update fails.
    pub fn force_free<D: Dialect>(&self, client: &Client<D>) -> Result<(), MigrateError> {
        self.release(client, None)?;
        tracing::info!(table = %self.table, "migration lock forcibly freed");
        Ok(())
    }

    /// Whether the lock is currently held.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the lock table cannot be read.
    pub fn is_locked(&self, exec: &mut dyn Executor) -> Result<bool, MigrateError> {
        let sql = {
            let g = exec.grammar();
            format!(
                "SELECT {} FROM {}",
                g.wrap_identifier("is_locked"),
                g.wrap_identifier(&self.table)
            )
        };
        for row in exec.execute(&Statement::select(sql))?.into_rows() {
            if row.get_opt_i64("is_locked")? == Some(1) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Turns a transaction that could not begin because another session holds
/// the database writer lock into [`MigrateError::LockHeld`].
///
/// On dialects that take the writer lock at `BEGIN`, a runner mid-batch
/// keeps every contender out of the lock row entirely, so the contender
/// never reaches the compare-and-set.
pub(crate) fn writer_contention<D: Dialect>(
    client: &Client<D>,
    err: MigrateError,
) -> MigrateError {
    match &err {
        MigrateError::Db(
            db @ DbError::TransactionAbort {
                action: TransactionAction::Begin,
                ..
            },
        ) if client.is_busy(db) => {
            tracing::debug!(error = %db, "database writer lock held by another session");
            MigrateError::LockHeld
        }
        _ => err,
    }
}
