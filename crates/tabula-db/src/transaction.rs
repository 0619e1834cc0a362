//! Transaction-scoped unit of work.
//!
//! [`TxScope`] exposes the tenant write/read surface bound to a single
//! connection inside an open transaction. It performs no ownership checks:
//! opening the transaction through an authenticated [`crate::TenantHandle`]
//! is the authorisation for everything done inside it.

use crate::error::{DbError, Result};
use crate::rows;
use crate::statement::{check_declared_target, ensure_read};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tabula_types::{Row, TenantId, Value};

/// Handle passed to a transaction body. Statements run in submission order.
pub struct TxScope<'c> {
    tx: &'c Transaction<'c>,
    tenant: &'c TenantId,
}

impl std::fmt::Debug for TxScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxScope")
            .field("tenant", self.tenant)
            .finish_non_exhaustive()
    }
}

impl<'c> TxScope<'c> {
    /// The tenant that opened the transaction.
    pub fn tenant(&self) -> &TenantId {
        self.tenant
    }

    /// Inserts one row and returns its rowid.
    pub fn insert(&self, table: &str, row: &Row) -> Result<i64> {
        rows::insert(self.conn(), table, row)
    }

    /// Updates rows matching `where_sql` and returns the affected count.
    pub fn update(&self, table: &str, row: &Row, where_sql: &str, params: &[Value]) -> Result<usize> {
        rows::update(self.conn(), table, row, where_sql, params)
    }

    pub fn delete(&self, table: &str, where_sql: &str, params: &[Value]) -> Result<usize> {
        rows::delete(self.conn(), table, where_sql, params)
    }

    pub fn select(
        &self,
        table: &str,
        columns: &[&str],
        where_sql: Option<&str>,
        params: &[Value],
    ) -> Result<Vec<Row>> {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        rows::select(self.conn(), table, &columns, where_sql, params)
    }

    /// Runs a read-only statement.
    pub fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        ensure_read(sql)?;
        rows::query(self.conn(), sql, params)
    }

    /// Runs a raw write against the declared `table`.
    pub fn execute_update(&self, table: &str, sql: &str, params: &[Value]) -> Result<usize> {
        check_declared_target(table, sql)?;
        rows::execute(self.conn(), table, sql, params)
    }

    fn conn(&self) -> &Connection {
        self.tx
    }
}

/// Runs `body` inside an immediate transaction on `conn`.
///
/// Commits when `body` returns `Ok`. Any error from `body` rolls the
/// transaction back and is returned wrapped in [`DbError::Transaction`].
pub(crate) fn run<T, F>(conn: &mut Connection, tenant: &TenantId, body: F) -> Result<T>
where
    F: FnOnce(&TxScope<'_>) -> Result<T>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| DbError::query("begin", "transaction", &e))?;

    let outcome = {
        let scope = TxScope { tx: &tx, tenant };
        body(&scope)
    };

    match outcome {
        Ok(value) => {
            tx.commit()
                .map_err(|e| DbError::query("commit", "transaction", &e))?;
            tracing::debug!(tenant = %tenant, "transaction committed");
            Ok(value)
        }
        Err(cause) => {
            if let Err(e) = tx.rollback() {
                tracing::error!(tenant = %tenant, error = %e, "transaction rollback failed");
            }
            tracing::warn!(tenant = %tenant, error = %cause, "transaction rolled back");
            Err(DbError::Transaction(Box::new(cause)))
        }
    }
}
