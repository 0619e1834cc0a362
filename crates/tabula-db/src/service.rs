//! Tenant-facing data access.
//!
//! [`DataService`] owns the shared machinery: the connection pool, the table
//! ownership registry, the batch processor, and the migration engine. Callers
//! never use it to touch data directly. The host resolves an identity once
//! and calls [`DataService::for_tenant`]; every operation on the returned
//! [`TenantHandle`] carries that identity through the write gate.
//!
//! All database work runs on the blocking thread pool, bounded by a
//! semaphore sized from [`ServiceSettings::max_concurrent_operations`].

use crate::batch::{BatchCallback, BatchProcessor, DEFAULT_BATCH_THRESHOLD};
use crate::error::{DbError, Result};
use crate::identifier::validate_table;
use crate::migrations::{MigrationEngine, MIGRATIONS_TABLE};
use crate::ownership::OwnershipRegistry;
use crate::pool::{ConnectionPool, DbRuntimeSettings};
use crate::query::QueryBuilder;
use crate::rows;
use crate::statement::{check_declared_target, ensure_read, StatementKind};
use crate::transaction::{self, TxScope};
use rusqlite::Connection;
use std::sync::Arc;
use tabula_types::{Row, TableInfo, TenantId, Value};
use tokio::sync::Semaphore;

/// Construction parameters for a [`DataService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// SQLite database path.
    pub path: String,
    pub runtime: DbRuntimeSettings,
    /// Pending items per SQL text before a batch group flushes itself.
    pub batch_size_threshold: usize,
    /// Upper bound on database operations running at once.
    pub max_concurrent_operations: usize,
}

impl ServiceSettings {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            runtime: DbRuntimeSettings::default(),
            batch_size_threshold: DEFAULT_BATCH_THRESHOLD,
            max_concurrent_operations: 16,
        }
    }
}

struct Inner {
    pool: Arc<ConnectionPool>,
    ownership: OwnershipRegistry,
    batches: BatchProcessor,
    migrations: MigrationEngine,
    permits: Semaphore,
}

/// Shared data-access service. Cheap to clone.
#[derive(Clone)]
pub struct DataService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService")
            .field("pool", &self.inner.pool)
            .field("owned_tables", &self.inner.ownership.len())
            .finish_non_exhaustive()
    }
}

impl DataService {
    /// Creates the service. No connection is opened until first use.
    pub fn new(settings: ServiceSettings) -> Self {
        let pool = Arc::new(ConnectionPool::new(settings.path, settings.runtime));
        let ownership = OwnershipRegistry::new();
        // The migration ledger is never tenant-writable. Claiming an empty
        // registry cannot fail.
        let _ = ownership.claim(MIGRATIONS_TABLE, &TenantId::system());

        Self {
            inner: Arc::new(Inner {
                batches: BatchProcessor::new(Arc::clone(&pool), settings.batch_size_threshold),
                migrations: MigrationEngine::new(Arc::clone(&pool)),
                permits: Semaphore::new(settings.max_concurrent_operations.max(1)),
                ownership,
                pool,
            }),
        }
    }

    /// Binds `tenant` as the caller identity for every operation on the
    /// returned handle.
    pub fn for_tenant(&self, tenant: TenantId) -> TenantHandle {
        TenantHandle {
            service: self.clone(),
            tenant,
        }
    }

    pub fn migrations(&self) -> &MigrationEngine {
        &self.inner.migrations
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn batches(&self) -> &BatchProcessor {
        &self.inner.batches
    }

    /// Returns `true` if a usable connection pool can be obtained.
    pub async fn is_healthy(&self) -> bool {
        self.inner.pool.is_healthy().await
    }

    /// Flushes every pending batch group; returns the number of items drained.
    pub async fn flush_batches(&self) -> usize {
        self.inner.batches.flush(None).await
    }

    /// Flushes pending batches, then closes the pool.
    pub async fn shutdown(&self) {
        let flushed = self.flush_batches().await;
        if flushed > 0 {
            tracing::info!(count = flushed, "flushed pending batches before shutdown");
        }
        self.inner.permits.close();
        self.inner.pool.shutdown();
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| DbError::Connection("data service is shut down".to_string()))?;
        self.inner.pool.with_connection(f).await
    }

    fn check_write(&self, table: &str, tenant: &TenantId) -> Result<()> {
        validate_table(table)?;
        self.inner.ownership.check_write(table, tenant)
    }
}

/// A tenant's view of the data service.
#[derive(Clone)]
pub struct TenantHandle {
    service: DataService,
    tenant: TenantId,
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl TenantHandle {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn service(&self) -> &DataService {
        &self.service
    }

    /// Creates `name` if it does not exist and claims it for this tenant.
    ///
    /// # Errors
    ///
    /// - `DbError::Validation` for a malformed name.
    /// - `DbError::Query` if another tenant owns the table or SQLite rejects
    ///   the schema.
    pub async fn create_table(&self, name: &str, schema: &str) -> Result<bool> {
        self.service.check_write(name, &self.tenant)?;
        let (table, schema) = (name.to_string(), schema.to_string());
        self.service
            .run(move |conn| rows::create_table(conn, &table, &schema))
            .await?;
        self.service.inner.ownership.claim(name, &self.tenant)?;
        tracing::info!(table = name, tenant = %self.tenant, "table created");
        Ok(true)
    }

    /// Drops `name` if it exists and releases its ownership.
    ///
    /// Dropping a table that does not exist succeeds.
    pub async fn drop_table(&self, name: &str) -> Result<bool> {
        self.service.check_write(name, &self.tenant)?;
        let table = name.to_string();
        self.service
            .run(move |conn| rows::drop_table(conn, &table))
            .await?;
        self.service.inner.ownership.release(name);
        tracing::info!(table = name, tenant = %self.tenant, "table dropped");
        Ok(true)
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let table = name.to_string();
        self.service
            .run(move |conn| rows::table_exists(conn, &table))
            .await
    }

    /// Column layout of `name`, or `None` if the table does not exist.
    pub async fn table_info(&self, name: &str) -> Result<Option<TableInfo>> {
        let table = name.to_string();
        self.service
            .run(move |conn| rows::table_info(conn, &table))
            .await
    }

    /// Inserts one row and returns its rowid.
    pub async fn insert(&self, table: &str, row: Row) -> Result<i64> {
        self.service.check_write(table, &self.tenant)?;
        let target = table.to_string();
        self.service
            .run(move |conn| rows::insert(conn, &target, &row))
            .await
    }

    /// Inserts every row in one transaction and returns their rowids in
    /// order. Either all rows are inserted or none are.
    pub async fn insert_batch(&self, table: &str, records: Vec<Row>) -> Result<Vec<i64>> {
        self.service.check_write(table, &self.tenant)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let target = table.to_string();
        let count = records.len();
        let ids = self
            .service
            .run(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| DbError::query("begin", &target, &e))?;
                let ids = records
                    .iter()
                    .map(|row| rows::insert(&tx, &target, row))
                    .collect::<Result<Vec<_>>>()?;
                tx.commit()
                    .map_err(|e| DbError::query("commit", &target, &e))?;
                Ok(ids)
            })
            .await?;
        tracing::debug!(table, count, "batch insert committed");
        Ok(ids)
    }

    /// Updates rows matching `where_sql` (all rows if empty). The row's values
    /// bind before `params`.
    pub async fn update(
        &self,
        table: &str,
        row: Row,
        where_sql: &str,
        params: Vec<Value>,
    ) -> Result<usize> {
        self.service.check_write(table, &self.tenant)?;
        let (target, where_sql) = (table.to_string(), where_sql.to_string());
        self.service
            .run(move |conn| rows::update(conn, &target, &row, &where_sql, &params))
            .await
    }

    /// Deletes rows matching `where_sql` (all rows if empty).
    pub async fn delete(&self, table: &str, where_sql: &str, params: Vec<Value>) -> Result<usize> {
        self.service.check_write(table, &self.tenant)?;
        let (target, where_sql) = (table.to_string(), where_sql.to_string());
        self.service
            .run(move |conn| rows::delete(conn, &target, &where_sql, &params))
            .await
    }

    /// Reads rows from any table. An empty column list selects `*`.
    pub async fn select(
        &self,
        table: &str,
        columns: &[&str],
        where_sql: Option<&str>,
        params: Vec<Value>,
    ) -> Result<Vec<Row>> {
        let target = table.to_string();
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let where_sql = where_sql.map(str::to_string);
        self.service
            .run(move |conn| rows::select(conn, &target, &columns, where_sql.as_deref(), &params))
            .await
    }

    /// Runs a read-only statement.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` for statements that would write; those go
    /// through [`TenantHandle::execute_update`].
    pub async fn execute_query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        ensure_read(sql)?;
        let sql = sql.to_string();
        self.service
            .run(move |conn| rows::query(conn, &sql, &params))
            .await
    }

    /// Runs a raw write against the declared `table`.
    ///
    /// The write gate is applied to `table`, and the statement must write
    /// that table and no other. A raw `CREATE TABLE` claims `table` for this
    /// tenant, a raw `DROP TABLE` releases it, and
    /// `ALTER TABLE .. RENAME TO` moves the claim to the new name.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Validation` for statements that do not write
    /// `table`, that cannot be attributed to a single table (triggers,
    /// views, several statements), or that SQLite reports touching another
    /// table while preparing.
    pub async fn execute_update(&self, table: &str, sql: &str, params: Vec<Value>) -> Result<usize> {
        self.service.check_write(table, &self.tenant)?;
        let kind = check_declared_target(table, sql)?;
        let (creates, drops) = (kind.creates_table(), kind.drops_table());
        let renamed = match &kind {
            StatementKind::Rename { to, .. } => {
                self.service.check_write(to, &self.tenant)?;
                Some(to.clone())
            }
            _ => None,
        };

        let (target, statement) = (table.to_string(), sql.to_string());
        let changed = self
            .service
            .run(move |conn| rows::execute(conn, &target, &statement, &params))
            .await?;

        if creates {
            self.service.inner.ownership.claim(table, &self.tenant)?;
        } else if drops {
            self.service.inner.ownership.release(table);
        } else if let Some(to) = renamed {
            self.service.inner.ownership.rename(table, &to);
        }
        Ok(changed)
    }

    /// Runs `body` in one transaction on one connection.
    ///
    /// Operations inside `body` are not ownership-checked: opening the
    /// transaction through this handle authorises them.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Transaction` wrapping the body's error after the
    /// transaction was rolled back.
    pub async fn with_transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&TxScope<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tenant = self.tenant.clone();
        self.service
            .run(move |conn| transaction::run(conn, &tenant, body))
            .await
    }

    /// A query builder that executes as this tenant.
    pub fn query_builder(&self) -> QueryBuilder {
        QueryBuilder::bound(self.clone())
    }

    pub async fn is_healthy(&self) -> bool {
        self.service.is_healthy().await
    }

    pub fn table_owner(&self, table: &str) -> Option<TenantId> {
        self.service.inner.ownership.owner(table)
    }

    pub fn is_table_owner(&self, table: &str) -> bool {
        self.service.inner.ownership.is_owner(table, &self.tenant)
    }

    /// Queues a write for batched execution against the declared `table`.
    ///
    /// Only `INSERT`, `UPDATE` and `DELETE` may be batched. Gate and target
    /// checks run now; the outcome is delivered to `callback` when the group
    /// flushes. Must be called within a Tokio runtime.
    pub fn add_batch(
        &self,
        table: &str,
        sql: &str,
        params: Vec<Value>,
        callback: BatchCallback,
    ) -> Result<()> {
        self.service.check_write(table, &self.tenant)?;
        match check_declared_target(table, sql)? {
            StatementKind::Write { kind, .. } if kind.is_dml() => {}
            _ => {
                return Err(DbError::Validation(format!(
                    "batched statement for '{table}' must be an INSERT, UPDATE or DELETE"
                )))
            }
        }
        self.service.inner.batches.add_batch(table, sql, params, callback);
        Ok(())
    }
}
