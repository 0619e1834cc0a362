//! Prepare-time access guard.
//!
//! While a statement is prepared, SQLite reports every table it will read
//! or write to the connection's authorizer. [`AccessGuard`] installs an
//! authorizer for the lifetime of one statement and refuses:
//!
//! - on the read path, anything that writes, attaches, pragmas with a value,
//!   or controls transactions;
//! - on a write path, top-level writes to any table other than the declared
//!   one, and schema objects with bodies (triggers, views).
//!
//! Writes performed by existing triggers are attributed to the trigger and
//! allowed. Only one statement may be prepared per guarded call.

use crate::error::{DbError, Result};
use crate::statement::normalize_name;
use crate::sync;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{Batch, Connection, Statement};
use std::sync::{Arc, Mutex};

/// What a guarded statement is allowed to do.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Access<'a> {
    Read,
    /// Writes limited to the named table.
    Write(&'a str),
}

/// Authorizer bound to one connection; removed again on drop.
pub(crate) struct AccessGuard<'c> {
    conn: &'c Connection,
    target: String,
    reading: bool,
    refusal: Arc<Mutex<Option<String>>>,
}

impl<'c> AccessGuard<'c> {
    pub(crate) fn install(conn: &'c Connection, access: Access<'_>) -> Self {
        let refusal = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&refusal);
        let declared = match access {
            Access::Read => None,
            Access::Write(table) => Some(normalize_name(table)),
        };
        let target = declared.clone().unwrap_or_else(|| "query".to_string());

        conn.authorizer(Some(move |ctx: AuthContext<'_>| {
            if ctx.accessor.is_some() {
                return Authorization::Allow;
            }
            match refuse(&ctx.action, declared.as_deref()) {
                None => Authorization::Allow,
                Some(reason) => {
                    sync::lock(&slot, "access guard").get_or_insert(reason);
                    Authorization::Deny
                }
            }
        }));

        Self {
            conn,
            target,
            reading: matches!(access, Access::Read),
            refusal,
        }
    }

    /// Prepares exactly one statement under the guard.
    ///
    /// # Errors
    ///
    /// - `DbError::Query` for a write on the read path, or when SQLite
    ///   rejects the statement.
    /// - `DbError::Validation` for a refused write, an empty statement, or
    ///   more than one statement.
    pub(crate) fn prepare(&self, sql: &str) -> Result<Statement<'c>> {
        let mut batch = Batch::new(self.conn, sql);
        let statement = match batch.next() {
            Ok(Some(statement)) => statement,
            Ok(None) => {
                return Err(DbError::Validation(format!(
                    "empty statement for '{}'",
                    self.target
                )))
            }
            Err(e) => return Err(self.failed("prepare", &e)),
        };
        if !matches!(batch.next(), Ok(None)) {
            sync::lock(&self.refusal, "access guard").take();
            return Err(DbError::Validation(format!(
                "only one statement may be run per call on '{}'",
                self.target
            )));
        }
        if self.reading && !statement.readonly() {
            return Err(read_only_violation("statement is not read-only"));
        }
        Ok(statement)
    }

    /// Maps an execution error, preferring a recorded refusal.
    pub(crate) fn failed(&self, operation: &str, source: &rusqlite::Error) -> DbError {
        self.refused()
            .unwrap_or_else(|| DbError::query(operation, &self.target, source))
    }

    fn refused(&self) -> Option<DbError> {
        let reason = sync::lock(&self.refusal, "access guard").take()?;
        tracing::warn!(target_table = %self.target, reason = %reason, "statement refused by access guard");
        Some(if self.reading {
            read_only_violation(&reason)
        } else {
            DbError::Validation(reason)
        })
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        self.conn
            .authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
    }
}

fn read_only_violation(reason: &str) -> DbError {
    DbError::Query(format!(
        "{reason}; write statements must go through execute_update with a declared table"
    ))
}

/// Pragmas whose argument names a schema object rather than setting a value.
const INTROSPECTION_PRAGMAS: &[&str] = &[
    "table_info",
    "table_xinfo",
    "index_list",
    "index_info",
    "index_xinfo",
    "foreign_key_list",
];

/// Returns why `action` is refused, or `None` if it is allowed.
fn refuse(action: &AuthAction<'_>, declared: Option<&str>) -> Option<String> {
    let written = match *action {
        AuthAction::Read { .. }
        | AuthAction::Select
        | AuthAction::Function { .. }
        | AuthAction::Recursive => return None,
        AuthAction::Pragma {
            pragma_name,
            pragma_value,
        } => {
            let introspection = INTROSPECTION_PRAGMAS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(pragma_name));
            if pragma_value.is_none() || introspection {
                return None;
            }
            return Some(format!("PRAGMA {pragma_name} with a value is not permitted"));
        }
        AuthAction::Insert { table_name }
        | AuthAction::Delete { table_name }
        | AuthAction::Update { table_name, .. }
        | AuthAction::CreateTable { table_name }
        | AuthAction::CreateTempTable { table_name }
        | AuthAction::DropTable { table_name }
        | AuthAction::DropTempTable { table_name }
        | AuthAction::AlterTable { table_name, .. }
        | AuthAction::CreateIndex { table_name, .. }
        | AuthAction::CreateTempIndex { table_name, .. }
        | AuthAction::DropIndex { table_name, .. }
        | AuthAction::DropTempIndex { table_name, .. }
        | AuthAction::DropTrigger { table_name, .. }
        | AuthAction::DropTempTrigger { table_name, .. } => table_name,
        AuthAction::CreateTrigger { .. } | AuthAction::CreateTempTrigger { .. } => {
            return Some("triggers cannot be created through tenant statements".to_string())
        }
        AuthAction::CreateView { .. }
        | AuthAction::CreateTempView { .. }
        | AuthAction::DropView { .. }
        | AuthAction::DropTempView { .. } => {
            return Some("views cannot be created or dropped through tenant statements".to_string())
        }
        _ => return Some(format!("{action:?} is not permitted")),
    };

    // SQLite maintains its own catalog tables while running DDL.
    if is_internal(written) {
        return None;
    }
    match declared {
        Some(declared) if written.eq_ignore_ascii_case(declared) => None,
        Some(declared) => Some(format!(
            "statement writes table '{written}' but '{declared}' was declared"
        )),
        None => Some(format!("statement writes table '{written}'")),
    }
}

fn is_internal(table: &str) -> bool {
    table
        .get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("sqlite_"))
}
