//! Blocking wrappers for synchronous callers.
//!
//! Every method waits on the async operation of the same name, so the two
//! forms behave identically. Calls must come from outside the runtime's
//! worker threads (for example a plain `std::thread` or the main thread of a
//! synchronous program); blocking inside an async task panics.

use crate::batch::BatchCallback;
use crate::error::{DbError, Result};
use crate::query::QueryBuilder;
use crate::service::TenantHandle;
use crate::transaction::TxScope;
use tabula_types::{Row, TableInfo, TenantId, Value};
use tokio::runtime::Handle;

/// A [`TenantHandle`] that blocks the calling thread on each operation.
#[derive(Debug, Clone)]
pub struct BlockingTenant {
    inner: TenantHandle,
    runtime: Handle,
}

macro_rules! blocking {
    ($( $(#[$meta:meta])* fn $name:ident(&self $(, $arg:ident: $ty:ty)*) -> $ret:ty; )*) => {
        $(
            $(#[$meta])*
            pub fn $name(&self $(, $arg: $ty)*) -> $ret {
                self.runtime.block_on(self.inner.$name($($arg),*))
            }
        )*
    };
}

impl BlockingTenant {
    /// Wraps `inner`, driving its futures on `runtime`.
    pub fn new(inner: TenantHandle, runtime: Handle) -> Self {
        Self { inner, runtime }
    }

    /// Wraps `inner` using the runtime of the current context.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Initialization` when called outside a Tokio runtime.
    pub fn current(inner: TenantHandle) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| DbError::Initialization(format!("no tokio runtime available: {e}")))?;
        Ok(Self::new(inner, runtime))
    }

    pub fn tenant(&self) -> &TenantId {
        self.inner.tenant()
    }

    /// The async handle this adapter wraps.
    pub fn handle(&self) -> &TenantHandle {
        &self.inner
    }

    blocking! {
        fn create_table(&self, name: &str, schema: &str) -> Result<bool>;
        fn drop_table(&self, name: &str) -> Result<bool>;
        fn table_exists(&self, name: &str) -> Result<bool>;
        fn table_info(&self, name: &str) -> Result<Option<TableInfo>>;
        /// Inserts one row and returns its rowid.
        fn insert(&self, table: &str, row: Row) -> Result<i64>;
        fn insert_batch(&self, table: &str, records: Vec<Row>) -> Result<Vec<i64>>;
        fn update(&self, table: &str, row: Row, where_sql: &str, params: Vec<Value>) -> Result<usize>;
        fn delete(&self, table: &str, where_sql: &str, params: Vec<Value>) -> Result<usize>;
        fn select(
            &self,
            table: &str,
            columns: &[&str],
            where_sql: Option<&str>,
            params: Vec<Value>
        ) -> Result<Vec<Row>>;
        fn execute_query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>>;
        fn execute_update(&self, table: &str, sql: &str, params: Vec<Value>) -> Result<usize>;
        fn is_healthy(&self) -> bool;
    }

    /// Runs `body` in one transaction; see [`TenantHandle::with_transaction`].
    pub fn with_transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&TxScope<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.runtime.block_on(self.inner.with_transaction(body))
    }

    /// A builder bound to this tenant; run it with [`BlockingTenant::fetch`].
    pub fn query_builder(&self) -> QueryBuilder {
        self.inner.query_builder()
    }

    /// Executes a builder and waits for its rows.
    pub fn fetch(&self, builder: QueryBuilder) -> Result<Vec<Row>> {
        self.runtime.block_on(builder.execute())
    }

    /// Executes `SELECT COUNT(*)` over a builder's query.
    pub fn count(&self, builder: QueryBuilder) -> Result<i64> {
        self.runtime.block_on(builder.execute_count())
    }

    pub fn table_owner(&self, table: &str) -> Option<TenantId> {
        self.inner.table_owner(table)
    }

    pub fn is_table_owner(&self, table: &str) -> bool {
        self.inner.is_table_owner(table)
    }

    /// Queues a batched write; see [`TenantHandle::add_batch`].
    pub fn add_batch(
        &self,
        table: &str,
        sql: &str,
        params: Vec<Value>,
        callback: BatchCallback,
    ) -> Result<()> {
        let _guard = self.runtime.enter();
        self.inner.add_batch(table, sql, params, callback)
    }
}
