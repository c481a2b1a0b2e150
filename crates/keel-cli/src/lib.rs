//! Command-line front end for the Keel migration runner.
//!
//! Wires a [`Config`] into a SQLite [`Client`] and an [`FsMigrationSource`],
//! runs one [`Command`], and renders the result as JSON.

pub mod config;

use std::str::FromStr;
use std::sync::Arc;

use keel_db::{Client, DbError, QueryListener, SqliteDialect, TracingListener};
use keel_migrate::{FsMigrationSource, MigrateError, Migrator};
use serde_json::{json, Value};
use thiserror::Error;

pub use config::{load_config, Config, ConfigError};

/// A runner command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply every pending migration.
    Latest,
    /// Revert the last batch.
    Rollback,
    /// Revert every applied migration.
    RollbackAll,
    /// Apply the next pending migration, or the named one.
    Up(Option<String>),
    /// Revert the last applied migration, or the named one.
    Down(Option<String>),
    /// Number of pending migrations.
    Status,
    /// Highest applied version.
    Version,
    /// Applied and pending migrations.
    List,
    /// Forcibly clear the migration lock.
    Unlock,
}

/// Returned when a command name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command '{0}' (expected one of: latest, rollback, rollback-all, up, down, status, version, list, unlock)")]
pub struct ParseCommandError(pub String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Self::Latest),
            "rollback" => Ok(Self::Rollback),
            "rollback-all" => Ok(Self::RollbackAll),
            "up" => Ok(Self::Up(None)),
            "down" => Ok(Self::Down(None)),
            "status" => Ok(Self::Status),
            "version" => Ok(Self::Version),
            "list" => Ok(Self::List),
            "unlock" => Ok(Self::Unlock),
            other => Err(ParseCommandError(other.to_string())),
        }
    }
}

impl Command {
    /// Attaches a migration name to `up` and `down`; other commands ignore it.
    pub fn with_migration(self, name: Option<String>) -> Self {
        match self {
            Self::Up(_) => Self::Up(name),
            Self::Down(_) => Self::Down(name),
            other => other,
        }
    }
}

/// Errors surfaced by the runner.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Command(#[from] ParseCommandError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open database: {0}")]
    Db(#[from] DbError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this failure. A held lock gets its own code so
    /// scripts can retry.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Migrate(MigrateError::LockHeld) => 3,
            Self::Command(_) => 2,
            _ => 1,
        }
    }
}

/// Builds a migrator for `config`.
///
/// # Errors
///
/// Returns `CliError::Db` if the connection pool cannot be created.
pub fn build_migrator(config: &Config) -> Result<Migrator<SqliteDialect>, CliError> {
    let dialect = SqliteDialect::file(&config.database.path, config.database.sqlite_settings());
    let listener: Arc<dyn QueryListener> = Arc::new(TracingListener);
    let client = Client::with_listeners(dialect, config.database.pool_settings(), vec![listener])?;
    Ok(Migrator::new(
        client,
        FsMigrationSource::new(&config.migrations.directory),
        config.migrations.migrator.clone(),
    ))
}

/// Runs `command` and returns its JSON result.
///
/// # Errors
///
/// Returns `CliError::Migrate` with the migrator's error.
pub fn run(migrator: &Migrator<SqliteDialect>, command: &Command) -> Result<Value, CliError> {
    let output = match command {
        Command::Latest => serde_json::to_value(migrator.latest()?)?,
        Command::Rollback => serde_json::to_value(migrator.rollback()?)?,
        Command::RollbackAll => serde_json::to_value(migrator.rollback_all()?)?,
        Command::Up(name) => serde_json::to_value(migrator.up(name.as_deref())?)?,
        Command::Down(name) => serde_json::to_value(migrator.down(name.as_deref())?)?,
        Command::Status => json!({ "pending": migrator.status()? }),
        Command::Version => json!({ "version": migrator.current_version()? }),
        Command::List => serde_json::to_value(migrator.list()?)?,
        Command::Unlock => {
            migrator.force_free_lock()?;
            json!({ "unlocked": true })
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> Config {
        let migrations = dir.path().join("migrations");
        std::fs::create_dir(&migrations).expect("create migrations dir");
        std::fs::write(
            migrations.join("20240101_users.sql"),
            "-- migrate:up\nCREATE TABLE users (id INTEGER PRIMARY KEY);\n-- migrate:down\nDROP TABLE users;\n",
        )
        .expect("write migration");
        std::fs::write(
            migrations.join("20240202_posts.sql"),
            "-- migrate:up\nCREATE TABLE posts (id INTEGER PRIMARY KEY);\n-- migrate:down\nDROP TABLE posts;\n",
        )
        .expect("write migration");

        let mut config = Config::default();
        config.database.path = dir
            .path()
            .join("keel.db")
            .to_str()
            .expect("temp path should be utf-8")
            .to_string();
        config.migrations.directory = migrations
            .to_str()
            .expect("temp path should be utf-8")
            .to_string();
        config
    }

    #[test]
    fn parses_commands() {
        assert_eq!("latest".parse::<Command>(), Ok(Command::Latest));
        assert_eq!("rollback-all".parse::<Command>(), Ok(Command::RollbackAll));
        assert_eq!(
            "up".parse::<Command>()
                .map(|c| c.with_migration(Some("x".to_string()))),
            Ok(Command::Up(Some("x".to_string())))
        );
        assert_eq!(
            "status".parse::<Command>().map(|c| c.with_migration(Some("x".to_string()))),
            Ok(Command::Status)
        );
        assert!("migrate".parse::<Command>().is_err());
    }

    #[test]
    fn commands_render_json() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let config = setup(&dir);
        let migrator = build_migrator(&config).expect("migrator");

        let version = run(&migrator, &Command::Version).expect("version");
        assert_eq!(version, json!({ "version": "none" }));

        let latest = run(&migrator, &Command::Latest).expect("latest");
        assert_eq!(
            latest,
            json!({
                "batch": 1,
                "direction": "up",
                "migrations": ["20240101_users.sql", "20240202_posts.sql"],
            })
        );

        assert_eq!(
            run(&migrator, &Command::Status).expect("status"),
            json!({ "pending": 0 })
        );
        assert_eq!(
            run(&migrator, &Command::Version).expect("version"),
            json!({ "version": "20240202" })
        );

        let down = run(&migrator, &Command::Down(None)).expect("down");
        assert_eq!(down["migrations"], json!(["20240202_posts.sql"]));

        let list = run(&migrator, &Command::List).expect("list");
        assert_eq!(
            list,
            json!({
                "completed": ["20240101_users.sql"],
                "pending": ["20240202_posts.sql"],
            })
        );

        assert_eq!(
            run(&migrator, &Command::Unlock).expect("unlock"),
            json!({ "unlocked": true })
        );
    }

    #[test]
    fn lock_held_has_its_own_exit_code() {
        let err = CliError::Migrate(MigrateError::LockHeld);
        assert_eq!(err.exit_code(), 3);
        assert_eq!(
            CliError::Command(ParseCommandError("nope".to_string())).exit_code(),
            2
        );
    }
}
