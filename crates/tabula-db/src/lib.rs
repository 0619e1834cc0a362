//! Multi-tenant data access over a shared SQLite database.
//!
//! Tenants share one database file and one connection pool. Every table has
//! at most one owning tenant; writes to an owned table by anyone else are
//! refused, while reads are open to all tenants.
//!
//! # Design decisions
//!
//! - **Identity per handle**: the host resolves a caller's [`TenantId`] once
//!   and obtains a [`TenantHandle`] from [`DataService::for_tenant`]. No
//!   operation looks up "the current caller" implicitly.
//! - **Declared targets for raw writes**: [`TenantHandle::execute_update`]
//!   takes the table it writes to. The statement is parsed up front and must
//!   name that table, then SQLite's authorizer refuses any write outside it
//!   while the statement is prepared.
//! - **Async core, blocking adapter**: every operation runs on the blocking
//!   thread pool; [`BlockingTenant`] waits on the same futures for
//!   synchronous callers.
//! - **`r2d2` connection pool** with WAL mode, lazy initialisation, debounced
//!   health checks and a single reconnect attempt per call.

mod batch;
mod blocking;
mod error;
mod guard;
mod identifier;
mod migrations;
mod ownership;
mod pool;
mod query;
mod rows;
mod service;
mod statement;
mod sync;
mod transaction;

pub use batch::{
    BatchCallback, BatchFailure, BatchOutcome, BatchProcessor, DEFAULT_BATCH_THRESHOLD,
};
pub use blocking::BlockingTenant;
pub use error::{DbError, Result};
pub use identifier::{
    is_column_expression, quote, quote_table, validate, validate_column, validate_table,
    IdentifierKind, MAX_IDENTIFIER_LEN,
};
pub use migrations::{Migration, MigrationEngine, MigrationError, MIGRATIONS_TABLE};
pub use ownership::OwnershipRegistry;
pub use pool::{create_pool, ConnectionPool, DbPool, DbRuntimeSettings, PoolStats};
pub use query::{Order, QueryBuilder};
pub use service::{DataService, ServiceSettings, TenantHandle};
pub use statement::{classify, StatementKind, WriteKind};
pub use transaction::TxScope;

pub use tabula_types::{PoolStatus, Row, TableInfo, TenantId, Value};
