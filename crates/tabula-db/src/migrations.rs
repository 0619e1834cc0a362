//! Versioned schema migrations.
//!
//! Callers register [`Migration`]s (a version, `up` statements, optional
//! `down` statements, and an optional precondition). [`MigrationEngine::migrate`]
//! applies every registered version not yet recorded in `schema_migrations`,
//! in ascending order, each inside its own transaction. The first failure
//! rolls back that migration and stops the run; later migrations are not
//! attempted.

use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::sync;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tabula_types::MigrationRecord;
use thiserror::Error;

/// Name of the metadata table tracking applied versions.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// Precondition checked inside the migration's transaction before any `up`
/// statement runs.
pub type Validator = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// One ordered schema change.
#[derive(Clone)]
pub struct Migration {
    version: i64,
    description: String,
    up: Vec<String>,
    down: Vec<String>,
    validate: Option<Validator>,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("up", &self.up.len())
            .field("down", &self.down.len())
            .field("validate", &self.validate.is_some())
            .finish()
    }
}

impl Migration {
    pub fn new(version: i64, description: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up: Vec::new(),
            down: Vec::new(),
            validate: None,
        }
    }

    /// Appends a forward statement.
    pub fn up(mut self, sql: impl Into<String>) -> Self {
        self.up.push(sql.into());
        self
    }

    /// Appends a reverse statement. Migrations without any are irreversible.
    pub fn down(mut self, sql: impl Into<String>) -> Self {
        self.down.push(sql.into());
        self
    }

    /// Sets the precondition. Returning `false` aborts the run.
    pub fn validate<F>(mut self, check: F) -> Self
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(check));
        self
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_reversible(&self) -> bool {
        !self.down.is_empty()
    }
}

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration {version} failed: {source}")]
    ExecutionFailed {
        /// The version of the migration that failed.
        version: i64,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// The migration's precondition returned `false`.
    #[error("migration {version} failed validation")]
    ValidationFailed { version: i64 },

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),

    /// A migration with this version is already registered.
    #[error("migration version {0} is already registered")]
    DuplicateVersion(i64),
}

/// Creates the metadata table if it does not exist.
pub fn ensure_migrations_table(conn: &Connection) -> std::result::Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now')),
            execution_time_ms INTEGER NOT NULL
        );",
    )
    .map_err(MigrationError::StateQuery)
}

fn applied_versions(conn: &Connection) -> std::result::Result<BTreeSet<i64>, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT version FROM schema_migrations")
        .map_err(MigrationError::StateQuery)?;
    let versions = stmt
        .query_map([], |row| row.get(0))
        .map_err(MigrationError::StateQuery)?
        .collect::<std::result::Result<BTreeSet<i64>, _>>()
        .map_err(MigrationError::StateQuery)?;
    Ok(versions)
}

/// Loads every applied migration record, lowest version first.
pub fn load_records(conn: &Connection) -> std::result::Result<Vec<MigrationRecord>, MigrationError> {
    let mut stmt = conn
        .prepare(
            "SELECT version, description, applied_at, execution_time_ms
             FROM schema_migrations ORDER BY version ASC",
        )
        .map_err(MigrationError::StateQuery)?;
    let records = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get(0)?,
                description: row.get(1)?,
                applied_at: row.get(2)?,
                execution_time_ms: row.get(3)?,
            })
        })
        .map_err(MigrationError::StateQuery)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(MigrationError::StateQuery)?;
    Ok(records)
}

/// Applies every migration in `migrations` whose version is not yet recorded.
///
/// `migrations` must be sorted by version. Returns the versions applied.
pub fn apply_pending(
    conn: &Connection,
    migrations: &[Migration],
) -> std::result::Result<Vec<i64>, MigrationError> {
    ensure_migrations_table(conn)?;
    let applied = applied_versions(conn)?;
    let mut newly_applied = Vec::new();

    for migration in migrations {
        if applied.contains(&migration.version) {
            tracing::debug!(
                version = migration.version,
                "migration already applied, skipping"
            );
            continue;
        }

        tracing::info!(
            version = migration.version,
            description = %migration.description,
            "applying migration"
        );
        let failed = |source: rusqlite::Error| MigrationError::ExecutionFailed {
            version: migration.version,
            source,
        };

        let started = Instant::now();
        let tx = conn.unchecked_transaction().map_err(failed)?;

        if let Some(check) = &migration.validate {
            if !check(&*tx) {
                tracing::warn!(version = migration.version, "migration precondition failed");
                return Err(MigrationError::ValidationFailed {
                    version: migration.version,
                });
            }
        }

        for statement in &migration.up {
            tx.execute_batch(statement).map_err(failed)?;
        }

        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        tx.execute(
            "INSERT INTO schema_migrations (version, description, execution_time_ms)
             VALUES (?1, ?2, ?3)",
            params![migration.version, migration.description, elapsed_ms],
        )
        .map_err(failed)?;

        tx.commit().map_err(failed)?;
        tracing::info!(
            version = migration.version,
            execution_time_ms = elapsed_ms,
            "migration applied"
        );
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}

/// Reverts the highest applied version.
///
/// Returns `Ok(None)` with a warning when nothing is applied, when the
/// applied version is no longer registered, or when it has no `down`
/// statements.
pub fn rollback_latest(
    conn: &Connection,
    migrations: &BTreeMap<i64, Migration>,
) -> std::result::Result<Option<i64>, MigrationError> {
    ensure_migrations_table(conn)?;
    let Some(version) = applied_versions(conn)?.last().copied() else {
        tracing::warn!("rollback requested but no migrations are applied");
        return Ok(None);
    };
    let Some(migration) = migrations.get(&version) else {
        tracing::warn!(version, "rollback requested for an unregistered migration");
        return Ok(None);
    };
    if !migration.is_reversible() {
        tracing::warn!(version, "migration is irreversible, rollback skipped");
        return Ok(None);
    }

    let failed = |source: rusqlite::Error| MigrationError::ExecutionFailed { version, source };
    let tx = conn.unchecked_transaction().map_err(failed)?;
    for statement in &migration.down {
        tx.execute_batch(statement).map_err(failed)?;
    }
    tx.execute(
        "DELETE FROM schema_migrations WHERE version = ?1",
        params![version],
    )
    .map_err(failed)?;
    tx.commit().map_err(failed)?;

    tracing::info!(version, "migration rolled back");
    Ok(Some(version))
}

/// Registry of migrations bound to a connection pool.
pub struct MigrationEngine {
    pool: Arc<ConnectionPool>,
    registered: Mutex<BTreeMap<i64, Migration>>,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("registered", &self.registered_versions())
            .finish_non_exhaustive()
    }
}

impl MigrationEngine {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            registered: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a migration.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::DuplicateVersion`] if the version is taken.
    pub fn register(&self, migration: Migration) -> std::result::Result<(), MigrationError> {
        let mut registered = sync::lock(&self.registered, "migration registry");
        if registered.contains_key(&migration.version) {
            return Err(MigrationError::DuplicateVersion(migration.version));
        }
        registered.insert(migration.version, migration);
        Ok(())
    }

    /// Registered versions, ascending.
    pub fn registered_versions(&self) -> Vec<i64> {
        sync::lock(&self.registered, "migration registry")
            .keys()
            .copied()
            .collect()
    }

    fn snapshot(&self) -> BTreeMap<i64, Migration> {
        sync::lock(&self.registered, "migration registry").clone()
    }

    /// Creates `schema_migrations` if needed. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .with_connection(|conn| Ok(ensure_migrations_table(conn)?))
            .await
    }

    /// Applies pending migrations; returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Migration` for the first migration that failed;
    /// migrations before it stay applied, none after it were attempted.
    pub async fn migrate(&self) -> Result<usize> {
        let migrations: Vec<Migration> = self.snapshot().into_values().collect();
        let applied = self
            .pool
            .with_connection(move |conn| Ok(apply_pending(conn, &migrations)?))
            .await?;
        if !applied.is_empty() {
            tracing::info!(count = applied.len(), "applied database migrations");
        }
        Ok(applied.len())
    }

    /// Reverts the highest applied version, if it can be reverted.
    pub async fn rollback(&self) -> Result<Option<i64>> {
        let migrations = self.snapshot();
        self.pool
            .with_connection(move |conn| Ok(rollback_latest(conn, &migrations)?))
            .await
    }

    /// Applied migration records, lowest version first.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        self.pool
            .with_connection(|conn| {
                ensure_migrations_table(conn)?;
                Ok(load_records(conn)?)
            })
            .await
    }

    /// Highest applied version.
    pub async fn current_version(&self) -> Result<Option<i64>> {
        Ok(self.applied().await?.last().map(|r| r.version))
    }

    /// Registered versions not yet applied, ascending.
    pub async fn pending(&self) -> Result<Vec<i64>> {
        let applied: BTreeSet<i64> = self.applied().await?.iter().map(|r| r.version).collect();
        Ok(self
            .registered_versions()
            .into_iter()
            .filter(|v| !applied.contains(v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrations() -> Vec<Migration> {
        vec![
            Migration::new(1, "create accounts")
                .up("CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
                .down("DROP TABLE accounts"),
            Migration::new(2, "add email")
                .up("ALTER TABLE accounts ADD COLUMN email TEXT")
                .up("CREATE INDEX accounts_email ON accounts(email)"),
        ]
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .expect("should query sqlite_master")
    }

    #[test]
    fn apply_on_fresh_db() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let applied = apply_pending(&conn, &migrations()).expect("migrations should succeed");
        assert_eq!(applied, vec![1, 2]);

        let records = load_records(&conn).expect("should load records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].description, "create accounts");
        assert!(records.iter().all(|r| r.execution_time_ms >= 0));
    }

    #[test]
    fn apply_is_idempotent() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        assert_eq!(apply_pending(&conn, &migrations()).expect("first run").len(), 2);
        assert!(apply_pending(&conn, &migrations()).expect("second run").is_empty());
    }

    #[test]
    fn side_effects_roll_back_when_tracking_insert_fails() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let conflicting = [Migration::new(1, "conflict").up(
            "CREATE TABLE rollback_marker (id INTEGER PRIMARY KEY);
             INSERT INTO schema_migrations (version, description, execution_time_ms)
             VALUES (1, 'squatter', 0);",
        )];

        let err = apply_pending(&conn, &conflicting)
            .expect_err("tracking insert conflict should fail migration");
        match err {
            MigrationError::ExecutionFailed { version, .. } => assert_eq!(version, 1),
            other => panic!("unexpected error type: {other:?}"),
        }
        assert!(
            !table_exists(&conn, "rollback_marker"),
            "schema side effects should be rolled back when tracking insert fails"
        );
    }

    #[test]
    fn failed_validation_stops_the_run() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let list = [
            Migration::new(1, "first").up("CREATE TABLE one (id INTEGER)"),
            Migration::new(2, "guarded")
                .validate(|_| false)
                .up("CREATE TABLE two (id INTEGER)"),
            Migration::new(3, "third").up("CREATE TABLE three (id INTEGER)"),
        ];
        let err = apply_pending(&conn, &list).expect_err("validation should fail");
        assert!(matches!(err, MigrationError::ValidationFailed { version: 2 }));
        assert!(table_exists(&conn, "one"));
        assert!(!table_exists(&conn, "two"));
        assert!(!table_exists(&conn, "three"));
        let versions: Vec<i64> = load_records(&conn)
            .expect("records")
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1]);
    }

    #[test]
    fn validator_sees_current_schema() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let list = [
            Migration::new(1, "base").up("CREATE TABLE base (id INTEGER)"),
            Migration::new(2, "needs base")
                .validate(|conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM sqlite_master WHERE name = 'base'",
                        [],
                        |row| row.get::<_, i64>(0),
                    )
                    .map(|n| n == 1)
                    .unwrap_or(false)
                })
                .up("CREATE TABLE child (id INTEGER)"),
        ];
        assert_eq!(apply_pending(&conn, &list).expect("should apply"), vec![1, 2]);
    }

    #[test]
    fn rollback_reverts_only_the_latest_reversible_version() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let list = [
            Migration::new(1, "a")
                .up("CREATE TABLE a (id INTEGER)")
                .down("DROP TABLE a"),
            Migration::new(2, "b")
                .up("CREATE TABLE b (id INTEGER)")
                .down("DROP TABLE b"),
        ];
        apply_pending(&conn, &list).expect("apply");
        let registry: BTreeMap<i64, Migration> =
            list.iter().cloned().map(|m| (m.version(), m)).collect();

        assert_eq!(rollback_latest(&conn, &registry).expect("rollback"), Some(2));
        assert!(table_exists(&conn, "a"));
        assert!(!table_exists(&conn, "b"));
        assert_eq!(load_records(&conn).expect("records").len(), 1);
    }

    #[test]
    fn rollback_is_a_no_op_when_not_possible() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let empty = BTreeMap::new();
        assert_eq!(rollback_latest(&conn, &empty).expect("nothing applied"), None);

        let list = [Migration::new(1, "irreversible").up("CREATE TABLE x (id INTEGER)")];
        apply_pending(&conn, &list).expect("apply");
        let registry: BTreeMap<i64, Migration> =
            list.iter().cloned().map(|m| (m.version(), m)).collect();
        assert_eq!(rollback_latest(&conn, &registry).expect("irreversible"), None);
        assert_eq!(rollback_latest(&conn, &empty).expect("unregistered"), None);
        assert!(table_exists(&conn, "x"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("m.db").to_string_lossy().into_owned();
        let engine = MigrationEngine::new(Arc::new(ConnectionPool::new(
            path,
            crate::pool::DbRuntimeSettings::default(),
        )));
        engine.register(Migration::new(1, "a")).expect("first");
        let err = engine.register(Migration::new(1, "b")).expect_err("duplicate");
        assert!(matches!(err, MigrationError::DuplicateVersion(1)));
        assert_eq!(engine.registered_versions(), vec![1]);
    }
}
