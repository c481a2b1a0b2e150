//! Migrator configuration.

use serde::Deserialize;

/// Tunables for a [`Migrator`](crate::Migrator).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigratorConfig {
    /// Table recording applied migrations.
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Table holding the lock row. Defaults to `<table_name>_lock`.
    #[serde(default)]
    pub lock_table_name: Option<String>,

    /// Run migrations outside transactions unless a migration opts in.
    #[serde(default)]
    pub disable_transactions: bool,

    /// Skip the check that every applied migration is still defined.
    #[serde(default)]
    pub disable_migrations_list_validation: bool,

    /// File extensions recognized as migrations.
    #[serde(default = "default_load_extensions")]
    pub load_extensions: Vec<String>,
}

fn default_table_name() -> String {
    "keel_migrations".to_string()
}

fn default_load_extensions() -> Vec<String> {
    vec![".sql".to_string()]
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
            lock_table_name: None,
            disable_transactions: false,
            disable_migrations_list_validation: false,
            load_extensions: default_load_extensions(),
        }
    }
}

impl MigratorConfig {
    /// Name of the lock table.
    pub fn lock_table(&self) -> String {
        self.lock_table_name
            .clone()
            .unwrap_or_else(|| format!("{}_lock", self.table_name))
    }

    /// Whether transactions are enabled globally.
    pub fn transactions_enabled(&self) -> bool {
        !self.disable_transactions
    }
}
