//! Keel migration runner binary.
//!
//! Usage: `keel <command> [config-path] [migration]`
//!
//! Loads configuration, initializes structured logging on stderr, runs one
//! command against the configured database, and prints the result as JSON
//! on stdout.

use std::process::ExitCode;

use keel_cli::{build_migrator, load_config, run, CliError, Command};
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(2)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("KEEL_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn execute() -> Result<(), CliError> {
    let command: Command = std::env::args()
        .nth(1)
        .unwrap_or_default()
        .parse()?;
    let command = command.with_migration(std::env::args().nth(3));

    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("keel.toml"));
    let config = load_config(selected_config_path)?;

    init_tracing(&config.logging.level, config.logging.json);
    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved configuration path"
    );

    let migrator = build_migrator(&config)?;
    let output = run(&migrator, &command)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn main() -> ExitCode {
    match execute() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("{}", serde_json::json!({ "error": err.to_string() }));
            ExitCode::from(err.exit_code())
        }
    }
}
