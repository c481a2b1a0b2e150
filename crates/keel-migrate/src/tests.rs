//! Unit tests for the migration runner.

use std::time::Duration;

use keel_db::{
    Client, DbError, Method, PoolSettings, QueryResponse, SqliteDialect, SqliteSettings, Statement,
    Value,
};
use tempfile::TempDir;

use crate::{
    CurrentVersion, Direction, FsMigrationSource, MigrateError, MigrationDefinition, Migrator,
    MigratorConfig, StaticMigrationSource, TransactionPolicy,
};

fn test_client(dir: &TempDir, settings: PoolSettings) -> Client<SqliteDialect> {
    let path = dir.path().join("migrate.db");
    let dialect = SqliteDialect::file(
        path.to_str().expect("temp path should be utf-8"),
        SqliteSettings::default(),
    );
    Client::new(dialect, settings).expect("failed to create client")
}

/// A migration creating (and dropping) a one-column table.
fn create_table(name: &str, table: &str) -> MigrationDefinition {
    MigrationDefinition::sql(
        name,
        format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY);"),
        Some(format!("DROP TABLE {table};")),
    )
}

fn broken(name: &str) -> MigrationDefinition {
    MigrationDefinition::sql(name, "THIS IS NOT SQL;", Some(String::new()))
}

fn migrator(
    client: &Client<SqliteDialect>,
    migrations: Vec<MigrationDefinition>,
    config: MigratorConfig,
) -> Migrator<SqliteDialect> {
    Migrator::new(client.clone(), StaticMigrationSource::new(migrations), config)
}

fn table_exists(client: &Client<SqliteDialect>, table: &str) -> bool {
    let rows = client
        .run(
            &Statement::select("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table),
        )
        .expect("sqlite_master query should succeed")
        .into_rows();
    !rows.is_empty()
}

fn set_lock(client: &Client<SqliteDialect>, value: i64) {
    client
        .run(&Statement::update("UPDATE keel_migrations_lock SET is_locked = ?").bind(value))
        .expect("lock update should succeed");
}

// ── current_version / status ─────────────────────────────────────────

#[test]
fn current_version_is_none_before_anything_runs() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, vec![create_table("20240101_init", "init")], MigratorConfig::default());

    let version = m.current_version().expect("version should load");
    assert_eq!(version, CurrentVersion::None);
    assert_eq!(version.to_string(), "none");

    m.latest().expect("latest should succeed");
    assert_eq!(
        m.current_version().expect("version should load").to_string(),
        "20240101"
    );
}

#[test]
fn status_counts_pending_migrations() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(
        &client,
        vec![create_table("001_a", "a"), create_table("002_b", "b")],
        MigratorConfig::default(),
    );

    assert_eq!(m.status().expect("status"), 2);
    m.latest().expect("latest should succeed");
    assert_eq!(m.status().expect("status"), 0);
}

// ── latest / rollback ────────────────────────────────────────────────

#[test]
fn latest_then_rollback_round_trip() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(
        &client,
        vec![create_table("001_a", "a"), create_table("002_b", "b")],
        MigratorConfig::default(),
    );

    let up = m.latest().expect("latest should succeed");
    assert_eq!(up.batch, 1);
    assert_eq!(up.direction, Direction::Up);
    assert_eq!(up.migrations, vec!["001_a", "002_b"]);
    assert!(table_exists(&client, "a"));
    assert!(table_exists(&client, "b"));

    let again = m.latest().expect("second latest should succeed");
    assert!(again.migrations.is_empty(), "nothing left to apply");
    assert_eq!(again.batch, 1, "empty batch reports the last batch");

    let down = m.rollback().expect("rollback should succeed");
    assert_eq!(down.batch, 1);
    assert_eq!(down.direction, Direction::Down);
    assert_eq!(down.migrations, vec!["002_b", "001_a"], "reverse order");
    assert!(!table_exists(&client, "a"));
    assert!(!table_exists(&client, "b"));
    assert!(m.list().expect("list").completed.is_empty());
}

#[test]
fn rollback_reverts_only_the_last_batch() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());

    migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default())
        .latest()
        .expect("first batch");

    let m = migrator(
        &client,
        vec![
            create_table("001_a", "a"),
            create_table("002_b", "b"),
            create_table("003_c", "c"),
        ],
        MigratorConfig::default(),
    );
    let second = m.latest().expect("second batch");
    assert_eq!(second.batch, 2);
    assert_eq!(second.migrations, vec!["002_b", "003_c"]);

    let down = m.rollback().expect("rollback");
    assert_eq!(down.batch, 2);
    assert_eq!(down.migrations, vec!["003_c", "002_b"]);
    assert_eq!(m.list().expect("list").completed, vec!["001_a"]);
    assert!(table_exists(&client, "a"));
}

#[test]
fn rollback_all_reverts_every_batch() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());

    migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default())
        .latest()
        .expect("first batch");
    let m = migrator(
        &client,
        vec![create_table("001_a", "a"), create_table("002_b", "b")],
        MigratorConfig::default(),
    );
    m.latest().expect("second batch");

    let down = m.rollback_all().expect("rollback all");
    assert_eq!(down.migrations, vec!["002_b", "001_a"]);
    assert_eq!(m.status().expect("status"), 2);
}

#[test]
fn rollback_with_nothing_applied_is_empty() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default());

    let down = m.rollback().expect("rollback should succeed");
    assert!(down.migrations.is_empty());
    assert_eq!(down.batch, 0);
    assert!(!m.is_locked().expect("lock state"));
}

// ── failures ─────────────────────────────────────────────────────────

#[test]
fn failure_keeps_earlier_migrations_in_their_own_transactions() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let config = MigratorConfig {
        disable_transactions: true,
        ..MigratorConfig::default()
    };
    let m = migrator(
        &client,
        vec![
            create_table("001_a", "a").with_transaction(TransactionPolicy::ForceOn),
            broken("002_b").with_transaction(TransactionPolicy::ForceOn),
            create_table("003_c", "c").with_transaction(TransactionPolicy::ForceOn),
        ],
        config,
    );

    let err = m.latest().expect_err("002_b should fail");
    assert_eq!(err.migration_name(), Some("002_b"));
    match &err {
        MigrateError::Migration {
            direction, source, ..
        } => {
            assert_eq!(*direction, Direction::Up);
            assert!(source.as_query_error().is_some(), "driver error is kept");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.db_error().and_then(DbError::as_query_error).is_some());

    assert_eq!(m.list().expect("list").completed, vec!["001_a"]);
    assert!(table_exists(&client, "a"));
    assert!(!table_exists(&client, "c"), "nothing after the failure runs");
    assert!(!m.is_locked().expect("lock state"), "lock is released");
}

#[test]
fn failure_in_shared_transaction_rolls_back_the_whole_batch() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(
        &client,
        vec![create_table("001_a", "a"), broken("002_b")],
        MigratorConfig::default(),
    );

    let err = m.latest().expect_err("002_b should fail");
    assert_eq!(err.migration_name(), Some("002_b"));
    assert!(m.list().expect("list").completed.is_empty());
    assert!(!table_exists(&client, "a"));
    assert!(!m.is_locked().expect("lock state"));
}

#[test]
fn unreadable_migration_time_is_a_decode_error() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default());
    m.ensure_tables().expect("tables");
    client
        .run(
            &Statement::insert(
                "INSERT INTO keel_migrations (name, batch, migration_time) VALUES (?, ?, ?)",
            )
            .bind("001_a")
            .bind(1)
            .bind(Value::Null),
        )
        .expect("insert record");

    match m.list() {
        Err(MigrateError::Db(DbError::Decode { column, .. })) => {
            assert_eq!(column, "migration_time");
        }
        other => panic!("expected a decode error, got {other:?}"),
    }
}

#[test]
fn status_reads_while_another_session_holds_the_writer_lock() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("migrate.db");
    let dialect = SqliteDialect::file(
        path.to_str().expect("temp path should be utf-8"),
        SqliteSettings { busy_timeout_ms: 50 },
    );
    let client = Client::new(dialect, PoolSettings::default()).expect("failed to create client");
    let m = migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default());
    m.ensure_tables().expect("tables");

    let mut holder = client.acquire().expect("acquire holder");
    let held = client.begin(&mut holder).expect("holder begins");

    assert_eq!(m.status().expect("status while the writer is busy"), 1);
    assert!(matches!(m.latest(), Err(MigrateError::LockHeld)));

    held.rollback().expect("holder rolls back");
    assert_eq!(m.latest().expect("latest").migrations, vec!["001_a"]);
}

#[test]
fn missing_definition_is_a_corrupt_directory() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    migrator(
        &client,
        vec![create_table("001_a", "a"), create_table("002_b", "b")],
        MigratorConfig::default(),
    )
    .latest()
    .expect("latest should succeed");

    let m = migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default());
    match m.latest() {
        Err(MigrateError::CorruptMigrationDirectory { missing }) => {
            assert_eq!(missing, vec!["002_b"]);
        }
        other => panic!("expected corrupt directory, got {other:?}"),
    }

    // Read-only inspection still works and reports the drift.
    assert_eq!(m.status().expect("status"), -1);

    let lenient = migrator(
        &client,
        vec![create_table("001_a", "a"), create_table("003_c", "c")],
        MigratorConfig {
            disable_migrations_list_validation: true,
            ..MigratorConfig::default()
        },
    );
    let outcome = lenient.latest().expect("validation disabled");
    assert_eq!(outcome.migrations, vec!["003_c"]);
}

#[test]
fn incomplete_migration_is_rejected_before_anything_runs() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(
        &client,
        vec![
            create_table("001_a", "a"),
            MigrationDefinition::sql("002_b", "CREATE TABLE b (id INTEGER);", None),
        ],
        MigratorConfig {
            disable_transactions: true,
            ..MigratorConfig::default()
        },
    );

    match m.latest() {
        Err(MigrateError::InvalidMigrationShape { name }) => assert_eq!(name, "002_b"),
        other => panic!("expected invalid shape, got {other:?}"),
    }
    assert!(!table_exists(&client, "a"), "validation precedes execution");
    assert!(!m.is_locked().expect("lock state"));
}

// ── lock ─────────────────────────────────────────────────────────────

#[test]
fn held_lock_blocks_latest_and_stays_held() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default());
    m.ensure_tables().expect("tables");
    set_lock(&client, 1);

    let err = m.latest().expect_err("lock is held");
    assert!(err.is_lock_held());
    assert!(m.is_locked().expect("lock state"), "lock row left untouched");
    assert!(!table_exists(&client, "a"));

    m.force_free_lock().expect("force free");
    assert!(!m.is_locked().expect("lock state"));
    m.latest().expect("latest after force free");
    assert!(table_exists(&client, "a"));
}

#[test]
fn force_free_on_a_fresh_database_is_a_no_op() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, Vec::new(), MigratorConfig::default());

    m.force_free_lock().expect("force free");
    assert!(!m.is_locked().expect("lock state"));
}

#[test]
fn missing_lock_row_is_recreated_held() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, Vec::new(), MigratorConfig::default());
    m.ensure_tables().expect("tables");
    client
        .run(&Statement::delete("DELETE FROM keel_migrations_lock"))
        .expect("delete lock row");

    m.lock().acquire(&client, None).expect("acquire recreates the row");
    let count = match client
        .run(&Statement::raw("SELECT COUNT(*) AS n FROM keel_migrations_lock").method(Method::First))
        .expect("count")
    {
        QueryResponse::Row(Some(row)) => row.get_i64("n").expect("n"),
        other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(count, 1);

    let mut conn = client.acquire().expect("acquire");
    assert!(m.lock().is_locked(&mut conn).expect("lock state"));
}

#[test]
fn custom_table_names_are_used() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(
        &client,
        vec![create_table("001_a", "a")],
        MigratorConfig {
            table_name: "schema_history".to_string(),
            lock_table_name: Some("schema_lock".to_string()),
            ..MigratorConfig::default()
        },
    );

    m.latest().expect("latest");
    assert!(table_exists(&client, "schema_history"));
    assert!(table_exists(&client, "schema_lock"));
    assert!(!table_exists(&client, "keel_migrations"));
}

// ── up / down / list ─────────────────────────────────────────────────

#[test]
fn up_and_down_step_one_migration() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(
        &client,
        vec![
            create_table("001_a", "a"),
            create_table("002_b", "b"),
            create_table("003_c", "c"),
        ],
        MigratorConfig::default(),
    );

    let first = m.up(None).expect("up");
    assert_eq!(first.migrations, vec!["001_a"]);
    assert_eq!(first.batch, 1);

    let named = m.up(Some("003_c")).expect("up named");
    assert_eq!(named.migrations, vec!["003_c"]);
    assert_eq!(named.batch, 2);

    let list = m.list().expect("list");
    assert_eq!(list.completed, vec!["001_a", "003_c"]);
    assert_eq!(list.pending, vec!["002_b"]);

    let down = m.down(Some("001_a")).expect("down named");
    assert_eq!(down.migrations, vec!["001_a"]);
    assert!(!table_exists(&client, "a"));

    let last = m.down(None).expect("down last");
    assert_eq!(last.migrations, vec!["003_c"]);

    let list = m.list().expect("list");
    assert!(list.completed.is_empty());
    assert_eq!(list.pending, vec!["001_a", "002_b", "003_c"]);
}

#[test]
fn up_and_down_reject_unknown_names() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(&dir, PoolSettings::default());
    let m = migrator(&client, vec![create_table("001_a", "a")], MigratorConfig::default());

    assert!(matches!(
        m.down(Some("001_a")),
        Err(MigrateError::MigrationNotFound { .. })
    ));
    m.latest().expect("latest");
    assert!(matches!(
        m.up(Some("001_a")),
        Err(MigrateError::MigrationNotFound { .. })
    ));
}

// ── sources and pooling ──────────────────────────────────────────────

#[test]
fn runs_sql_files_from_a_directory() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let migrations = dir.path().join("migrations");
    std::fs::create_dir(&migrations).expect("create migrations dir");
    std::fs::write(
        migrations.join("001_users.sql"),
        "-- migrate:up\nCREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);\nCREATE INDEX users_name ON users (name);\n-- migrate:down\nDROP TABLE users;\n",
    )
    .expect("write migration");
    std::fs::write(
        migrations.join("002_seed.sql"),
        "-- migrate:transaction=off\n-- migrate:up\nINSERT INTO users (name) VALUES ('root');\n-- migrate:down\nDELETE FROM users;\n",
    )
    .expect("write migration");

    let client = test_client(&dir, PoolSettings::default());
    let m = Migrator::new(
        client.clone(),
        FsMigrationSource::new(&migrations),
        MigratorConfig::default(),
    );

    let outcome = m.latest().expect("latest");
    assert_eq!(outcome.migrations, vec!["001_users.sql", "002_seed.sql"]);
    assert!(table_exists(&client, "users"));

    m.rollback().expect("rollback");
    assert!(!table_exists(&client, "users"));
}

#[test]
fn works_with_a_single_connection_pool() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let client = test_client(
        &dir,
        PoolSettings {
            max_size: 1,
            connection_timeout: Duration::from_secs(2),
            ..PoolSettings::default()
        },
    );

    for config in [
        MigratorConfig::default(),
        MigratorConfig {
            disable_transactions: true,
            ..MigratorConfig::default()
        },
    ] {
        let m = migrator(
            &client,
            vec![create_table("001_a", "a"), create_table("002_b", "b")],
            config,
        );
        m.latest().expect("latest on one connection");
        m.rollback().expect("rollback on one connection");
    }
}
