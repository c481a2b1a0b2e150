//! Runner configuration loading from file and environment variables.

use std::time::Duration;

use keel_db::{PoolSettings, SqliteSettings};
use keel_migrate::MigratorConfig;
use serde::Deserialize;
use thiserror::Error;

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Where migrations live and how they are recorded.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,

    /// How long to wait for a pooled connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

/// Migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding the `.sql` migration files.
    #[serde(default = "default_migrations_dir")]
    pub directory: String,

    #[serde(flatten)]
    pub migrator: MigratorConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "keel_migrate=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_db_path() -> String {
    "keel.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    4
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_migrations_dir() -> String {
    "migrations".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            migrator: MigratorConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl DatabaseConfig {
    pub fn sqlite_settings(&self) -> SqliteSettings {
        SqliteSettings {
            busy_timeout_ms: self.busy_timeout_ms,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_size: self.pool_max_size.max(1),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            ..PoolSettings::default()
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `KEEL_DB_PATH` overrides `database.path`
/// - `KEEL_MIGRATIONS_DIR` overrides `migrations.directory`
/// - `KEEL_MIGRATIONS_TABLE` overrides `migrations.table_name`
/// - `KEEL_LOG_LEVEL` overrides `logging.level`
/// - `KEEL_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(db_path) = var("KEEL_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(dir) = var("KEEL_MIGRATIONS_DIR") {
        config.migrations.directory = dir;
    }
    if let Some(table) = var("KEEL_MIGRATIONS_TABLE") {
        config.migrations.migrator.table_name = table;
    }
    if let Some(level) = var("KEEL_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("KEEL_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).expect("missing file is not an error");

        assert_eq!(config.database.busy_timeout_ms, 5_000);
        assert_eq!(config.database.pool_max_size, 4);
        assert!(config.migrations.migrator.lock_table_name.is_none());
        assert_eq!(config.migrations.migrator.load_extensions, vec![".sql"]);
    }

    #[test]
    fn defaults_without_overrides() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |_| None);

        assert_eq!(config.database.path, "keel.db");
        assert_eq!(config.migrations.directory, "migrations");
        assert_eq!(config.migrations.migrator.table_name, "keel_migrations");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn parses_all_sections() {
        let config: Config = toml::from_str(
            r#"
            [database]
            path = "/var/lib/app.db"
            busy_timeout_ms = 250
            pool_max_size = 2

            [migrations]
            directory = "db/migrations"
            table_name = "schema_history"
            disable_transactions = true
            load_extensions = [".sql", ".up.sql"]

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.database.path, "/var/lib/app.db");
        assert_eq!(config.database.sqlite_settings().busy_timeout_ms, 250);
        assert_eq!(config.database.pool_settings().max_size, 2);
        assert_eq!(config.database.connection_timeout_ms, 30_000);
        assert_eq!(config.migrations.directory, "db/migrations");
        assert_eq!(config.migrations.migrator.table_name, "schema_history");
        assert_eq!(config.migrations.migrator.lock_table(), "schema_history_lock");
        assert!(config.migrations.migrator.disable_transactions);
        assert_eq!(config.migrations.migrator.load_extensions.len(), 2);
        assert!(config.logging.json);
    }

    #[test]
    fn env_overrides_win() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| match key {
            "KEEL_DB_PATH" => Some("/tmp/override.db".to_string()),
            "KEEL_MIGRATIONS_TABLE" => Some("history".to_string()),
            "KEEL_LOG_JSON" => Some("1".to_string()),
            _ => None,
        });

        assert_eq!(config.database.path, "/tmp/override.db");
        assert_eq!(config.migrations.migrator.table_name, "history");
        assert!(config.logging.json);
        assert_eq!(config.migrations.directory, "migrations");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "[database\npath = ").expect("write config");

        let err = load_config(path.to_str()).expect_err("should not parse");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
