//! Migration definitions and the sources that supply them.
//!
//! A source hands the migrator every defined migration, sorted by name.
//! [`StaticMigrationSource`] holds migrations written in Rust;
//! [`FsMigrationSource`] reads `.sql` files with `-- migrate:up` and
//! `-- migrate:down` sections from a directory.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use keel_db::{DbError, Executor};
use serde::Serialize;

use crate::error::MigrateError;

/// Whether a batch applies or reverts migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// Per-migration override of the global transaction setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionPolicy {
    /// Follow the migrator's configuration.
    #[default]
    Inherit,
    /// Always run inside a transaction.
    ForceOn,
    /// Never run inside a transaction.
    ForceOff,
}

impl TransactionPolicy {
    /// Resolves the policy against the global setting.
    pub fn use_transaction(self, global: bool) -> bool {
        match self {
            Self::Inherit => global,
            Self::ForceOn => true,
            Self::ForceOff => false,
        }
    }
}

/// A migration operation.
pub type MigrationFn = Arc<dyn Fn(&mut dyn Executor) -> Result<(), DbError> + Send + Sync>;

/// One named migration.
#[derive(Clone)]
pub struct MigrationDefinition {
    name: String,
    up: Option<MigrationFn>,
    down: Option<MigrationFn>,
    transaction: TransactionPolicy,
}

impl fmt::Debug for MigrationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationDefinition")
            .field("name", &self.name)
            .field("up", &self.up.is_some())
            .field("down", &self.down.is_some())
            .field("transaction", &self.transaction)
            .finish()
    }
}

impl MigrationDefinition {
    /// Creates a migration with no operations yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            up: None,
            down: None,
            transaction: TransactionPolicy::Inherit,
        }
    }

    /// Sets the operation that applies the migration.
    pub fn with_up<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut dyn Executor) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.up = Some(Arc::new(f));
        self
    }

    /// Sets the operation that reverts the migration.
    pub fn with_down<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut dyn Executor) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.down = Some(Arc::new(f));
        self
    }

    /// Overrides the global transaction setting for this migration.
    pub fn with_transaction(mut self, policy: TransactionPolicy) -> Self {
        self.transaction = policy;
        self
    }

    /// Builds a migration from SQL scripts.
    pub fn sql(name: impl Into<String>, up: impl Into<String>, down: Option<String>) -> Self {
        let up: String = up.into();
        let mut migration =
            Self::new(name).with_up(move |exec: &mut dyn Executor| exec.execute_script(&up));
        if let Some(down) = down {
            migration = migration.with_down(move |exec: &mut dyn Executor| exec.execute_script(&down));
        }
        migration
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction_policy(&self) -> TransactionPolicy {
        self.transaction
    }

    /// Whether both operations are present.
    pub fn is_complete(&self) -> bool {
        self.up.is_some() && self.down.is_some()
    }

    pub(crate) fn operation(&self, direction: Direction) -> Option<&MigrationFn> {
        match direction {
            Direction::Up => self.up.as_ref(),
            Direction::Down => self.down.as_ref(),
        }
    }
}

/// Supplies migration definitions.
pub trait MigrationSource: Send + Sync {
    /// Returns every defined migration, sorted ascending by name.
    ///
    /// File based sources keep only names ending in one of `extensions`.
    /// Sources of code-defined migrations may ignore it.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Source` if definitions cannot be read.
    fn migrations(&self, extensions: &[String]) -> Result<Vec<MigrationDefinition>, MigrateError>;
}

/// Migrations defined in code.
#[derive(Debug, Clone, Default)]
pub struct StaticMigrationSource {
    migrations: Vec<MigrationDefinition>,
}

impl StaticMigrationSource {
    pub fn new(mut migrations: Vec<MigrationDefinition>) -> Self {
        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        Self { migrations }
    }
}

impl MigrationSource for StaticMigrationSource {
    fn migrations(&self, _extensions: &[String]) -> Result<Vec<MigrationDefinition>, MigrateError> {
        Ok(self.migrations.clone())
    }
}

/// SQL migration files in a directory.
///
/// Each file holds an up section and, optionally, a down section:
///
/// ```sql
/// -- migrate:up
/// CREATE TABLE users (id INTEGER PRIMARY KEY);
///
/// -- migrate:down
/// DROP TABLE users;
/// ```
///
/// Without a `-- migrate:up` marker, everything before `-- migrate:down` is
/// the up section. A `-- migrate:transaction=off` (or `=on`) line sets the
/// migration's transaction policy.
#[derive(Debug, Clone)]
pub struct FsMigrationSource {
    directory: PathBuf,
}

impl FsMigrationSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

impl MigrationSource for FsMigrationSource {
    fn migrations(&self, extensions: &[String]) -> Result<Vec<MigrationDefinition>, MigrateError> {
        let source_error = |source| MigrateError::Source {
            path: self.directory.display().to_string(),
            source,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.directory).map_err(source_error)? {
            let entry = entry.map_err(source_error)?;
            if !entry.file_type().map_err(source_error)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if extensions.iter().any(|ext| name.ends_with(ext.as_str())) {
                files.push((name, entry.path()));
            }
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let mut migrations = Vec::with_capacity(files.len());
        for (name, path) in files {
            let contents = std::fs::read_to_string(&path).map_err(|source| MigrateError::Source {
                path: path.display().to_string(),
                source,
            })?;
            migrations.push(parse_sql_migration(name, &contents));
        }

        tracing::debug!(
            directory = %self.directory.display(),
            count = migrations.len(),
            "loaded migration files"
        );
        Ok(migrations)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

fn parse_sql_migration(name: String, contents: &str) -> MigrationDefinition {
    let mut preamble = String::new();
    let mut up: Option<String> = None;
    let mut down: Option<String> = None;
    let mut policy = TransactionPolicy::Inherit;
    let mut section = Section::Preamble;

    for line in contents.lines() {
        let directive = line.trim().to_ascii_lowercase();
        match directive.as_str() {
            "-- migrate:up" => {
                section = Section::Up;
                up.get_or_insert_with(String::new);
                continue;
            }
            "-- migrate:down" => {
                section = Section::Down;
                down.get_or_insert_with(String::new);
                continue;
            }
            "-- migrate:transaction=off" => {
                policy = TransactionPolicy::ForceOff;
                continue;
            }
            "-- migrate:transaction=on" => {
                policy = TransactionPolicy::ForceOn;
                continue;
            }
            _ => {}
        }

        let target = match section {
            Section::Preamble => &mut preamble,
            Section::Up => up.get_or_insert_with(String::new),
            Section::Down => down.get_or_insert_with(String::new),
        };
        target.push_str(line);
        target.push('\n');
    }

    let up = up.unwrap_or(preamble);
    let mut migration = MigrationDefinition::sql(name, up, down);
    migration.transaction = policy;
    migration
}
