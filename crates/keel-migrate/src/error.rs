//! Error types for the migration engine.

use keel_db::DbError;
use thiserror::Error;

use crate::source::Direction;

/// Errors that can occur while inspecting or running migrations.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Another runner holds the migration lock. Nothing was changed.
    #[error("migration table is already locked by another runner")]
    LockHeld,

    /// Applied records reference migrations that are no longer defined.
    #[error("the migration directory is corrupt, the following files are missing: {}", .missing.join(", "))]
    CorruptMigrationDirectory {
        /// Every applied name without a definition.
        missing: Vec<String>,
    },

    /// A migration lacks its up or down operation.
    #[error("invalid migration '{name}': must have both an up and a down operation")]
    InvalidMigrationShape {
        /// The offending migration.
        name: String,
    },

    /// A migration named by the caller is not in the expected set.
    #[error("migration '{name}' not found")]
    MigrationNotFound {
        /// The requested name.
        name: String,
    },

    /// A migration's operation, or its bookkeeping, failed.
    ///
    /// `source` is the untouched error so callers can still branch on its
    /// kind.
    #[error("migration '{name}' ({direction}) failed: {source}")]
    Migration {
        /// The migration that failed.
        name: String,
        /// Whether it was being applied or reverted.
        direction: Direction,
        /// The underlying failure.
        #[source]
        source: DbError,
    },

    /// Migration definitions could not be loaded.
    #[error("failed to load migrations from '{path}': {source}")]
    Source {
        /// Directory or file being read.
        path: String,
        /// The I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A bookkeeping query, the pool, or a transaction boundary failed.
    #[error(transparent)]
    Db(#[from] DbError),
}

impl MigrateError {
    /// Returns `true` if the lock was held by someone else.
    pub fn is_lock_held(&self) -> bool {
        matches!(self, Self::LockHeld)
    }

    /// Name of the migration that failed, if the failure came from one.
    pub fn migration_name(&self) -> Option<&str> {
        match self {
            Self::Migration { name, .. } | Self::InvalidMigrationShape { name } => Some(name),
            _ => None,
        }
    }

    /// The database error at the root of this failure, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::Migration { source, .. } => Some(source),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}
