//! The batch runner.
//!
//! Every mutating operation follows the same sequence: load the defined and
//! applied sets, pick the migrations to run, take the lock, re-read the
//! applied set under the lock, check every migration has both operations,
//! run them one at a time in order, record each success, release the lock.
//!
//! Migrations never run in parallel and are never reordered. A failure
//! stops the batch. Migrations that already committed in their own
//! transaction stay applied.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use keel_db::{Client, Dialect, Executor, Transaction};
use serde::Serialize;

use crate::config::MigratorConfig;
use crate::error::MigrateError;
use crate::lock::{writer_contention, MigrationLock};
use crate::source::{Direction, MigrationDefinition, MigrationSource};
use crate::table::{MigrationRecord, Tables};

/// Result of running a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Batch number the migrations were applied in (or reverted from).
    pub batch: i64,
    pub direction: Direction,
    /// Migrations run, in execution order.
    pub migrations: Vec<String>,
}

/// Applied and pending migration names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationList {
    /// Applied, in application order.
    pub completed: Vec<String>,
    /// Not yet applied, ascending by name.
    pub pending: Vec<String>,
}

/// The highest applied version token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentVersion {
    /// Nothing is applied.
    None,
    /// The prefix before the first `_` of the highest applied migration.
    Version(String),
}

impl fmt::Display for CurrentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Version(v) => f.write_str(v),
        }
    }
}

impl Serialize for CurrentVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct MigrationSets {
    defined: Vec<MigrationDefinition>,
    applied: Vec<MigrationRecord>,
}

/// Applies and reverts migrations from a [`MigrationSource`].
pub struct Migrator<D: Dialect> {
    client: Client<D>,
    source: Arc<dyn MigrationSource>,
    config: MigratorConfig,
    tables: Tables,
    lock: MigrationLock,
}

impl<D: Dialect> fmt::Debug for Migrator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrator")
            .field("client", &self.client)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<D: Dialect> Migrator<D> {
    pub fn new(
        client: Client<D>,
        source: impl MigrationSource + 'static,
        config: MigratorConfig,
    ) -> Self {
        let lock_table = config.lock_table();
        Self {
            client,
            source: Arc::new(source),
            tables: Tables::new(config.table_name.clone(), lock_table.clone()),
            lock: MigrationLock::new(lock_table),
            config,
        }
    }

    pub fn client(&self) -> &Client<D> {
        &self.client
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// The lock this migrator coordinates through.
    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    /// Creates the bookkeeping tables and lock row if they are missing.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the tables cannot be created.
    pub fn ensure_tables(&self) -> Result<(), MigrateError> {
        // Reads never wait on a writer; only take the write lock when
        // something is actually missing.
        let ready = {
            let mut conn = self.client.acquire()?;
            self.tables.is_ready(&mut conn)
        };
        if ready {
            return Ok(());
        }

        self.client.transaction(|trx| {
            self.tables.ensure(trx)?;
            Ok(())
        })
    }

    /// Applies every pending migration as one new batch.
    ///
    /// When transactions are enabled and no pending migration opts out, the
    /// whole batch shares one transaction; otherwise each migration decides
    /// for itself.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld`, `CorruptMigrationDirectory`,
    /// `InvalidMigrationShape`, or `Migration` naming the migration that
    /// failed.
    pub fn latest(&self) -> Result<BatchOutcome, MigrateError> {
        let sets = self.load_sets(true)?;
        let pending = pending(sets.defined, &sets.applied);
        let outcome = self.run_planned(pending, Direction::Up)?;
        tracing::info!(
            batch = outcome.batch,
            count = outcome.migrations.len(),
            "migrated to latest"
        );
        Ok(outcome)
    }

    /// Reverts the most recent batch, newest migration first.
    ///
    /// # Errors
    ///
    /// As [`Migrator::latest`].
    pub fn rollback(&self) -> Result<BatchOutcome, MigrateError> {
        let sets = self.load_sets(true)?;
        let last_batch = sets.applied.iter().map(|r| r.batch).max();
        let targets: Vec<&MigrationRecord> = sets
            .applied
            .iter()
            .rev()
            .filter(|r| Some(r.batch) == last_batch)
            .collect();
        let migrations = resolve(&targets, &sets.defined)?;
        let outcome = self.run_planned(migrations, Direction::Down)?;
        tracing::info!(
            batch = outcome.batch,
            count = outcome.migrations.len(),
            "rolled back batch"
        );
        Ok(outcome)
    }

    /// Reverts every applied migration, newest first, as one batch.
    ///
    /// # Errors
    ///
    /// As [`Migrator::latest`].
    pub fn rollback_all(&self) -> Result<BatchOutcome, MigrateError> {
        let sets = self.load_sets(true)?;
        let targets: Vec<&MigrationRecord> = sets.applied.iter().rev().collect();
        let migrations = resolve(&targets, &sets.defined)?;
        self.run_planned(migrations, Direction::Down)
    }

    /// Applies the next pending migration, or the named one.
    ///
    /// # Errors
    ///
    /// Returns `MigrationNotFound` if `name` is not pending, otherwise as
    /// [`Migrator::latest`].
    pub fn up(&self, name: Option<&str>) -> Result<BatchOutcome, MigrateError> {
        let sets = self.load_sets(true)?;
        let pending = pending(sets.defined, &sets.applied);
        let selected = match name {
            Some(name) => match pending.into_iter().find(|m| m.name() == name) {
                Some(m) => vec![m],
                None => {
                    return Err(MigrateError::MigrationNotFound {
                        name: name.to_string(),
                    })
                }
            },
            None => pending.into_iter().take(1).collect(),
        };
        self.run_planned(selected, Direction::Up)
    }

    /// Reverts the last applied migration, or the named one.
    ///
    /// # Errors
    ///
    /// Returns `MigrationNotFound` if `name` is not applied, otherwise as
    /// [`Migrator::latest`].
    pub fn down(&self, name: Option<&str>) -> Result<BatchOutcome, MigrateError> {
        let sets = self.load_sets(true)?;
        let target = match name {
            Some(name) => match sets.applied.iter().find(|r| r.name == name) {
                Some(record) => vec![record],
                None => {
                    return Err(MigrateError::MigrationNotFound {
                        name: name.to_string(),
                    })
                }
            },
            None => sets.applied.last().into_iter().collect(),
        };
        let migrations = resolve(&target, &sets.defined)?;
        self.run_planned(migrations, Direction::Down)
    }

    /// Applied and pending migration names.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Source` or `MigrateError::Db`.
    pub fn list(&self) -> Result<MigrationList, MigrateError> {
        let sets = self.load_sets(false)?;
        let completed = sets.applied.iter().map(|r| r.name.clone()).collect();
        let pending = pending(sets.defined, &sets.applied)
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        Ok(MigrationList { completed, pending })
    }

    /// Defined count minus applied count.
    ///
    /// Zero when the counts match. Negative values mean more records are
    /// applied than defined and are reported as-is.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Source` or `MigrateError::Db`.
    pub fn status(&self) -> Result<i64, MigrateError> {
        let sets = self.load_sets(false)?;
        Ok(sets.defined.len() as i64 - sets.applied.len() as i64)
    }

    /// The highest version token among applied migrations.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the records cannot be read.
    pub fn current_version(&self) -> Result<CurrentVersion, MigrateError> {
        self.ensure_tables()?;
        let applied = {
            let mut conn = self.client.acquire()?;
            self.tables.list_applied(&mut conn)?
        };
        Ok(highest_version(applied.iter().map(|r| r.name.as_str())))
    }

    /// Clears the migration lock regardless of who holds it.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the lock table cannot be updated.
    pub fn force_free_lock(&self) -> Result<(), MigrateError> {
        self.ensure_tables()?;
        self.lock.force_free(&self.client)
    }

    /// Whether a runner currently holds the lock.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Db` if the lock table cannot be read.
    pub fn is_locked(&self) -> Result<bool, MigrateError> {
        self.ensure_tables()?;
        let mut conn = self.client.acquire()?;
        self.lock.is_locked(&mut conn)
    }

    fn load_sets(&self, validate: bool) -> Result<MigrationSets, MigrateError> {
        self.ensure_tables()?;
        let defined = self.source.migrations(&self.config.load_extensions)?;
        let applied = {
            let mut conn = self.client.acquire()?;
            self.tables.list_applied(&mut conn)?
        };

        if validate && !self.config.disable_migrations_list_validation {
            let known: HashSet<&str> = defined.iter().map(MigrationDefinition::name).collect();
            let missing: Vec<String> = applied
                .iter()
                .filter(|r| !known.contains(r.name.as_str()))
                .map(|r| r.name.clone())
                .collect();
            if !missing.is_empty() {
                return Err(MigrateError::CorruptMigrationDirectory { missing });
            }
        }

        Ok(MigrationSets { defined, applied })
    }

    fn transaction_for_all(&self, migrations: &[MigrationDefinition]) -> bool {
        self.config.transactions_enabled()
            && migrations
                .iter()
                .all(|m| m.transaction_policy().use_transaction(true))
    }

    fn run_planned(
        &self,
        migrations: Vec<MigrationDefinition>,
        direction: Direction,
    ) -> Result<BatchOutcome, MigrateError> {
        if self.transaction_for_all(&migrations) {
            self.client
                .transaction(|trx| self.run_batch(migrations, direction, Some(trx)))
                .map_err(|err| writer_contention(&self.client, err))
        } else {
            self.run_batch(migrations, direction, None)
        }
    }

    fn run_batch(
        &self,
        migrations: Vec<MigrationDefinition>,
        direction: Direction,
        mut outer: Option<&mut Transaction<'_, D>>,
    ) -> Result<BatchOutcome, MigrateError> {
        // Failing to acquire means we never held the lock, so there is
        // nothing of ours to release.
        self.lock.acquire(&self.client, outer.as_deref_mut())?;

        match self.run_locked(migrations, direction, outer.as_deref_mut()) {
            Ok(outcome) => {
                self.lock.release(&self.client, outer)?;
                Ok(outcome)
            }
            Err(err) => {
                match err.migration_name() {
                    Some(name) => {
                        tracing::error!(migration = name, %direction, error = %err, "migration failed")
                    }
                    None => tracing::error!(%direction, error = %err, "migration batch failed"),
                }
                if !err.is_lock_held() {
                    if let Err(cleanup) = self.lock.release(&self.client, outer) {
                        tracing::warn!(error = %cleanup, "failed to release migration lock after error");
                    }
                }
                Err(err)
            }
        }
    }

    fn run_locked(
        &self,
        migrations: Vec<MigrationDefinition>,
        direction: Direction,
        mut outer: Option<&mut Transaction<'_, D>>,
    ) -> Result<BatchOutcome, MigrateError> {
        // Another runner may have finished some of these while we waited.
        let applied = match outer.as_deref_mut() {
            Some(trx) => self.tables.list_applied(trx)?,
            None => {
                let mut conn = self.client.acquire()?;
                self.tables.list_applied(&mut conn)?
            }
        };
        let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
        let remaining: Vec<MigrationDefinition> = migrations
            .into_iter()
            .filter(|m| match direction {
                Direction::Up => !applied_names.contains(m.name()),
                Direction::Down => applied_names.contains(m.name()),
            })
            .collect();

        if let Some(m) = remaining.iter().find(|m| !m.is_complete()) {
            return Err(MigrateError::InvalidMigrationShape {
                name: m.name().to_string(),
            });
        }

        let last_batch = applied.iter().map(|r| r.batch).max().unwrap_or(0);
        let batch = match direction {
            Direction::Up if !remaining.is_empty() => last_batch + 1,
            _ => last_batch,
        };

        let mut completed = Vec::with_capacity(remaining.len());
        match outer {
            Some(trx) => {
                for migration in &remaining {
                    self.run_one(&mut *trx, migration, direction, batch)?;
                    completed.push(migration.name().to_string());
                }
            }
            None if remaining.is_empty() => {}
            None => {
                let global = self.config.transactions_enabled();
                let mut conn = self.client.acquire()?;
                for migration in &remaining {
                    if migration.transaction_policy().use_transaction(global) {
                        let wrap = |source| MigrateError::Migration {
                            name: migration.name().to_string(),
                            direction,
                            source,
                        };
                        let mut trx = self.client.begin(&mut conn).map_err(wrap)?;
                        self.run_one(&mut trx, migration, direction, batch)?;
                        trx.commit().map_err(wrap)?;
                    } else {
                        self.run_one(&mut conn, migration, direction, batch)?;
                    }
                    completed.push(migration.name().to_string());
                }
            }
        }

        Ok(BatchOutcome {
            batch,
            direction,
            migrations: completed,
        })
    }

    /// Runs one migration's operation and records the result on the same
    /// executor.
    fn run_one(
        &self,
        exec: &mut dyn Executor,
        migration: &MigrationDefinition,
        direction: Direction,
        batch: i64,
    ) -> Result<(), MigrateError> {
        let name = migration.name();
        let operation =
            migration
                .operation(direction)
                .ok_or_else(|| MigrateError::InvalidMigrationShape {
                    name: name.to_string(),
                })?;

        tracing::info!(migration = name, %direction, batch, "running migration");
        let wrap = |source| MigrateError::Migration {
            name: name.to_string(),
            direction,
            source,
        };

        operation(&mut *exec).map_err(wrap)?;
        let recorded = match direction {
            Direction::Up => self.tables.insert_record(exec, name, batch),
            Direction::Down => self.tables.delete_record(exec, name),
        };
        recorded.map_err(wrap)
    }
}

fn pending(defined: Vec<MigrationDefinition>, applied: &[MigrationRecord]) -> Vec<MigrationDefinition> {
    let applied: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
    defined
        .into_iter()
        .filter(|m| !applied.contains(m.name()))
        .collect()
}

/// Maps records to their definitions, keeping the records' order.
fn resolve(
    records: &[&MigrationRecord],
    defined: &[MigrationDefinition],
) -> Result<Vec<MigrationDefinition>, MigrateError> {
    let mut resolved = Vec::with_capacity(records.len());
    let mut missing = Vec::new();
    for record in records {
        match defined.iter().find(|m| m.name() == record.name) {
            Some(m) => resolved.push(m.clone()),
            None => missing.push(record.name.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(MigrateError::CorruptMigrationDirectory { missing });
    }
    Ok(resolved)
}

/// Numeric tokens compare by value; anything else sorts after them,
/// lexicographically.
fn highest_version<'a>(names: impl Iterator<Item = &'a str>) -> CurrentVersion {
    names
        .map(|name| name.split('_').next().unwrap_or(name))
        .max_by(|a, b| version_key(a).cmp(&version_key(b)))
        .map_or(CurrentVersion::None, |v| CurrentVersion::Version(v.to_string()))
}

fn version_key(token: &str) -> (bool, u128, &str) {
    match token.parse::<u128>() {
        Ok(n) => (false, n, ""),
        Err(_) => (true, 0, token),
    }
}
