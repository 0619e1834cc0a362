//! Connection pool creation and lifecycle management.
//!
//! [`create_pool`] builds an `r2d2` pool of SQLite connections with WAL mode,
//! foreign keys and a busy timeout. [`ConnectionPool`] wraps it with lazy
//! initialisation, debounced health checks and a single reconnect attempt
//! per call:
//!
//! ```text
//! Uninitialized -> Initializing -> Healthy <-> Unhealthy -> Closed
//! ```

use crate::error::{DbError, Result};
use crate::sync;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tabula_types::PoolStatus;

/// Runtime tunables for SQLite connection behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,

    /// Maximum number of pooled SQLite connections.
    pub pool_max_size: u32,

    /// How long a caller waits for a pooled connection, in milliseconds.
    pub connection_timeout_ms: u64,

    /// Minimum time between two health checks.
    pub health_check_interval: Duration,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            connection_timeout_ms: 5_000,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Connection counts reported by the underlying pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
    pub max_size: u32,
}

/// Creates a new SQLite connection pool with WAL mode and foreign keys enabled.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. `:memory:` gives every
///   pooled connection its own private database, so it is only useful with
///   `pool_max_size = 1`.
///
/// # Errors
///
/// Returns `DbError::Initialization` if the connection pool cannot be created.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let busy_timeout_ms = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                busy_timeout_ms
            ))
        });

    Pool::builder()
        .max_size(settings.pool_max_size)
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
        .build(manager)
        .map_err(|e| {
            DbError::Initialization(format!(
                "failed to create database connection pool: {e}"
            ))
        })
}

/// Runs the trivial round-trip query used as a health check.
fn ping(pool: &DbPool) -> Result<()> {
    let conn = pool.get()?;
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map_err(|e| DbError::Connection(format!("health check query failed: {e}")))?;
    Ok(())
}

/// Lazily created, self-healing connection pool.
///
/// The pool slot and status are bookkeeping behind short-held locks. Pool
/// creation and reconnection are serialised by an async mutex so that
/// concurrent first callers build a single pool; no `std` lock is held while
/// SQLite is touched.
pub struct ConnectionPool {
    path: String,
    settings: DbRuntimeSettings,
    slot: RwLock<Option<(u64, DbPool)>>,
    status: RwLock<PoolStatus>,
    lifecycle: tokio::sync::Mutex<()>,
    epoch: Instant,
    /// Milliseconds since `epoch` at the last successful check, 0 if never.
    last_check_ms: AtomicU64,
    generation: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Creates an uninitialised pool. Nothing is opened until first use.
    pub fn new(path: impl Into<String>, settings: DbRuntimeSettings) -> Self {
        Self {
            path: path.into(),
            settings,
            slot: RwLock::new(None),
            status: RwLock::new(PoolStatus::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
            epoch: Instant::now(),
            last_check_ms: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> PoolStatus {
        *sync::read(&self.status, "pool status")
    }

    /// Connection counts of the live pool, if one exists.
    pub fn stats(&self) -> Option<PoolStats> {
        sync::read(&self.slot, "pool slot").as_ref().map(|(_, pool)| {
            let state = pool.state();
            PoolStats {
                connections: state.connections,
                idle_connections: state.idle_connections,
                max_size: pool.max_size(),
            }
        })
    }

    /// Returns a usable pool, creating it on first use.
    ///
    /// Health checks are skipped while the last one is younger than the
    /// configured interval. Concurrent callers may occasionally both check;
    /// the check is idempotent.
    ///
    /// # Errors
    ///
    /// - `DbError::Connection` if the pool is closed or could not be recovered.
    ///   An unhealthy pool stays unhealthy until a reconnect succeeds.
    /// - `DbError::Initialization` if the first pool could not be created.
    pub async fn ensure_connection(&self) -> Result<DbPool> {
        self.ensure(false).await
    }

    /// Forces a health check regardless of the debounce interval.
    pub async fn check_health(&self) -> Result<()> {
        self.ensure(true).await.map(|_| ())
    }

    /// Returns `true` if a usable pool can be obtained.
    pub async fn is_healthy(&self) -> bool {
        self.ensure_connection().await.is_ok()
    }

    /// Runs `f` on a pooled connection inside the blocking worker pool.
    ///
    /// The connection is returned to the pool when `f` finishes.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.ensure_connection().await?;
        run_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut *conn)
        })
        .await
    }

    /// Closes the pool. Connections already handed out stay valid until
    /// dropped; every later call fails with `DbError::Connection`.
    pub fn shutdown(&self) {
        *sync::write(&self.status, "pool status") = PoolStatus::Closed;
        let previous = sync::write(&self.slot, "pool slot").take();
        if previous.is_some() {
            tracing::info!(path = %self.path, "database pool closed");
        }
    }

    async fn ensure(&self, force: bool) -> Result<DbPool> {
        if self.status() == PoolStatus::Closed {
            return Err(closed());
        }
        let current = sync::read(&self.slot, "pool slot").clone();
        let Some((generation, pool)) = current else {
            return self.initialize().await;
        };
        // An unhealthy pool is re-tested on every call until it recovers.
        let unhealthy = self.status() == PoolStatus::Unhealthy;
        if !force && !unhealthy && !self.check_due() {
            return Ok(pool);
        }

        let ping_pool = pool.clone();
        match run_blocking(move || ping(&ping_pool)).await {
            Ok(()) => {
                self.mark_checked();
                self.set_status(PoolStatus::Healthy);
                Ok(pool)
            }
            Err(e) => {
                tracing::warn!(path = %self.path, error = %e, "health check failed, recreating pool");
                self.reconnect(generation).await
            }
        }
    }

    async fn initialize(&self) -> Result<DbPool> {
        let _guard = self.lifecycle.lock().await;
        // Another caller may have finished while we waited.
        if let Some((_, pool)) = sync::read(&self.slot, "pool slot").clone() {
            return Ok(pool);
        }
        if self.status() == PoolStatus::Closed {
            return Err(closed());
        }
        self.set_status(PoolStatus::Initializing);
        tracing::debug!(path = %self.path, "initializing database pool");

        match self.build_and_ping().await {
            Ok(pool) => {
                self.install(pool.clone())?;
                tracing::info!(
                    path = %self.path,
                    max_size = self.settings.pool_max_size,
                    "database pool initialized"
                );
                Ok(pool)
            }
            Err(e) => {
                self.set_status(PoolStatus::Uninitialized);
                tracing::error!(path = %self.path, error = %e, "database pool initialization failed");
                Err(match e {
                    DbError::Initialization(msg) => DbError::Initialization(msg),
                    other => DbError::Initialization(other.to_string()),
                })
            }
        }
    }

    async fn reconnect(&self, stale_generation: u64) -> Result<DbPool> {
        let _guard = self.lifecycle.lock().await;
        if self.status() == PoolStatus::Closed {
            return Err(closed());
        }
        if let Some((generation, pool)) = sync::read(&self.slot, "pool slot").clone() {
            if generation != stale_generation {
                // Someone else already replaced the failing pool.
                return Ok(pool);
            }
        }

        // The stale pool stays in the slot until a replacement passes its
        // round-trip check, so later calls keep retrying through this path.
        match self.build_and_ping().await {
            Ok(pool) => {
                self.install(pool.clone())?;
                tracing::info!(path = %self.path, "database pool recreated");
                Ok(pool)
            }
            Err(e) => {
                self.set_status(PoolStatus::Unhealthy);
                tracing::error!(path = %self.path, error = %e, "database reconnect failed");
                Err(DbError::Connection(format!(
                    "reconnect to '{}' failed: {e}",
                    self.path
                )))
            }
        }
    }

    async fn build_and_ping(&self) -> Result<DbPool> {
        let path = self.path.clone();
        let settings = self.settings;
        run_blocking(move || {
            let pool = create_pool(&path, settings)?;
            ping(&pool)?;
            Ok(pool)
        })
        .await
    }

    fn install(&self, pool: DbPool) -> Result<()> {
        let mut status = sync::write(&self.status, "pool status");
        if *status == PoolStatus::Closed {
            return Err(closed());
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        *sync::write(&self.slot, "pool slot") = Some((generation, pool));
        *status = PoolStatus::Healthy;
        drop(status);
        self.mark_checked();
        Ok(())
    }

    fn check_due(&self) -> bool {
        let last = self.last_check_ms.load(Ordering::Relaxed);
        let now = self.now_ms();
        last == 0
            || now.saturating_sub(last) >= self.settings.health_check_interval.as_millis() as u64
    }

    fn mark_checked(&self) {
        self.last_check_ms.store(self.now_ms().max(1), Ordering::Relaxed);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn set_status(&self, next: PoolStatus) {
        let mut status = sync::write(&self.status, "pool status");
        if *status != PoolStatus::Closed {
            *status = next;
        }
    }
}

fn closed() -> DbError {
    DbError::Connection("connection pool is closed".to_string())
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DbError::Connection(format!("pool worker task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("pool.db").to_string_lossy().into_owned();
        (dir, path)
    }

    #[test]
    fn create_in_memory_pool() {
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
            ..DbRuntimeSettings::default()
        };

        let pool = create_pool(":memory:", settings).expect("pool creation should succeed");
        let conn = pool.get().expect("should get a connection");

        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert!(
            mode == "wal" || mode == "memory",
            "unexpected journal_mode: {mode}"
        );

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = conn
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");

        assert_eq!(pool.max_size(), 3, "pool max size should match settings");
    }

    #[tokio::test]
    async fn lazy_initialization_transitions_to_healthy() {
        let (_dir, path) = temp_db();
        let pool = ConnectionPool::new(path, DbRuntimeSettings::default());
        assert_eq!(pool.status(), PoolStatus::Uninitialized);
        assert!(pool.stats().is_none());

        pool.ensure_connection().await.expect("lazy init should succeed");
        assert_eq!(pool.status(), PoolStatus::Healthy);
        assert!(pool.stats().is_some());
    }

    #[tokio::test]
    async fn ensure_connection_reuses_pool_inside_interval() {
        let (_dir, path) = temp_db();
        let pool = ConnectionPool::new(path, DbRuntimeSettings::default());
        pool.ensure_connection().await.expect("init");
        let first = pool.last_check_ms.load(Ordering::Relaxed);
        pool.ensure_connection().await.expect("second call");
        assert_eq!(
            pool.last_check_ms.load(Ordering::Relaxed),
            first,
            "no health check should run inside the debounce interval"
        );
        assert_eq!(pool.generation.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn forced_check_keeps_same_pool_when_healthy() {
        let (_dir, path) = temp_db();
        let pool = ConnectionPool::new(path, DbRuntimeSettings::default());
        pool.ensure_connection().await.expect("init");
        pool.check_health().await.expect("healthy pool passes");
        assert_eq!(pool.generation.load(Ordering::Relaxed), 1);
        assert_eq!(pool.status(), PoolStatus::Healthy);
    }

    #[tokio::test]
    async fn initialization_failure_is_reported_and_retryable() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let missing = dir.path().join("no/such/dir/db.sqlite");
        let pool = ConnectionPool::new(
            missing.to_string_lossy().into_owned(),
            DbRuntimeSettings {
                connection_timeout_ms: 200,
                ..DbRuntimeSettings::default()
            },
        );
        let err = pool.ensure_connection().await.expect_err("path cannot be opened");
        assert!(matches!(err, DbError::Initialization(_)), "got {err}");
        assert_eq!(pool.status(), PoolStatus::Uninitialized);
    }

    #[tokio::test]
    async fn with_connection_runs_closure_on_pooled_connection() {
        let (_dir, path) = temp_db();
        let pool = ConnectionPool::new(path, DbRuntimeSettings::default());
        let answer = pool
            .with_connection(|conn| {
                conn.query_row("SELECT 40 + 2", [], |row| row.get::<_, i64>(0))
                    .map_err(|e| DbError::query("select", "health check", &e))
            })
            .await
            .expect("closure should run");
        assert_eq!(answer, 42);
    }

    fn fragile_pool() -> (tempfile::TempDir, std::path::PathBuf, ConnectionPool) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).expect("create data dir");
        let path = data_dir.join("pool.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::new(
            path,
            DbRuntimeSettings {
                pool_max_size: 1,
                connection_timeout_ms: 200,
                health_check_interval: Duration::ZERO,
                ..DbRuntimeSettings::default()
            },
        );
        (dir, data_dir, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_reconnect_stays_unhealthy() {
        let (_dir, data_dir, pool) = fragile_pool();
        let held = pool
            .ensure_connection()
            .await
            .expect("init")
            .get()
            .expect("take the only connection");
        std::fs::remove_dir_all(&data_dir).expect("remove data dir");

        for _ in 0..2 {
            let err = pool.ensure_connection().await.expect_err("health check and reconnect fail");
            assert!(matches!(err, DbError::Connection(_)), "got {err}");
            assert_eq!(pool.status(), PoolStatus::Unhealthy);
        }
        assert!(pool.stats().is_some(), "stale pool is kept until replaced");
        drop(held);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_health_check_recreates_the_pool() {
        let (_dir, data_dir, pool) = fragile_pool();
        let held = pool
            .ensure_connection()
            .await
            .expect("init")
            .get()
            .expect("take the only connection");
        assert_eq!(pool.generation.load(Ordering::Relaxed), 1);

        std::fs::remove_dir_all(&data_dir).expect("remove data dir");
        pool.check_health().await.expect_err("reconnect into a missing dir fails");
        assert_eq!(pool.status(), PoolStatus::Unhealthy);

        std::fs::create_dir_all(&data_dir).expect("restore data dir");
        let fresh = pool.ensure_connection().await.expect("reconnect succeeds");
        assert_eq!(pool.status(), PoolStatus::Healthy);
        assert_eq!(pool.generation.load(Ordering::Relaxed), 2);
        fresh
            .get()
            .expect("connection from the new pool")
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .expect("new pool answers");
        drop(held);
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let (_dir, path) = temp_db();
        let pool = ConnectionPool::new(path, DbRuntimeSettings::default());
        pool.ensure_connection().await.expect("init");
        pool.shutdown();
        assert_eq!(pool.status(), PoolStatus::Closed);
        let err = pool.ensure_connection().await.expect_err("closed pool");
        assert!(matches!(err, DbError::Connection(_)));
        assert!(!pool.is_healthy().await);
    }
}
