//! Versioned schema migrations for Keel.
//!
//! A [`Migrator`] applies migrations from a [`MigrationSource`] in name
//! order, records each applied migration together with the batch it ran
//! in, and reverts whole batches in reverse order. Runners in different
//! processes coordinate through a single persisted lock row so only one of
//! them mutates the schema at a time.
//!
//! # Design decisions
//!
//! - **Lock as a compare-and-set**: the lock row is read with the dialect's
//!   locking clause and flipped from `0` to `1` in the same transaction. A
//!   runner that sees `1` fails fast with [`MigrateError::LockHeld`] instead
//!   of waiting.
//! - **Re-check under the lock**: the applied set is read again after the
//!   lock is taken, so a runner that lost a race never re-applies what the
//!   winner already did.
//! - **Strictly sequential**: migrations in a batch run one at a time in
//!   order, each on the executor of the batch (or its own transaction).
//!
//! # Usage
//!
//! ```rust,ignore
//! use keel_db::{Client, PoolSettings, SqliteDialect, SqliteSettings};
//! use keel_migrate::{FsMigrationSource, Migrator, MigratorConfig};
//!
//! let dialect = SqliteDialect::file("app.db", SqliteSettings::default());
//! let client = Client::new(dialect, PoolSettings::default())?;
//! let migrator = Migrator::new(client, FsMigrationSource::new("migrations"), MigratorConfig::default());
//! let outcome = migrator.latest()?;
//! println!("batch {} ran {:?}", outcome.batch, outcome.migrations);
//! ```

mod config;
mod error;
mod lock;
mod migrator;
mod source;
mod table;

pub use config::MigratorConfig;
pub use error::MigrateError;
pub use lock::MigrationLock;
pub use migrator::{BatchOutcome, CurrentVersion, MigrationList, Migrator};
pub use source::{
    Direction, FsMigrationSource, MigrationDefinition, MigrationFn, MigrationSource,
    StaticMigrationSource, TransactionPolicy,
};
pub use table::MigrationRecord;

#[cfg(test)]
mod tests;
