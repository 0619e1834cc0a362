//! Classification of raw SQL statements.
//!
//! Raw SQL is parsed with `sqlparser` before any I/O. The classification
//! refuses writes sent through the read path, checks a raw write against
//! its declared table, and tells the facade which ownership change a raw
//! statement implies. It is not the last word: [`crate::guard`] re-checks
//! every statement against what SQLite itself reports while preparing it.

use crate::error::{DbError, Result};
use sqlparser::ast::{
    AlterTableOperation, FromTable, ObjectName, ObjectType, SetExpr, Statement, TableFactor,
    TableWithJoins,
};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;

/// Shape of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    AlterTable,
    CreateIndex,
}

impl WriteKind {
    /// Row-level writes; the only shapes accepted for batching.
    pub fn is_dml(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// Result of classifying a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    /// A single query.
    Read,
    /// A write whose only target is `table`.
    Write { kind: WriteKind, table: String },
    /// `ALTER TABLE <table> RENAME TO <to>`.
    Rename { table: String, to: String },
    /// Anything whose written tables cannot be attributed to one named
    /// table: triggers, views, pragmas, transaction control, several
    /// statements, or SQL the parser does not accept.
    Unsupported(String),
}

impl StatementKind {
    /// Returns `true` for writes, renames included.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Rename { .. })
    }

    /// Returns `true` for `CREATE TABLE` statements.
    pub fn creates_table(&self) -> bool {
        matches!(self, Self::Write { kind: WriteKind::CreateTable, .. })
    }

    /// Returns `true` for `DROP TABLE` statements.
    pub fn drops_table(&self) -> bool {
        matches!(self, Self::Write { kind: WriteKind::DropTable, .. })
    }
}

/// Parses `sql` and classifies it.
///
/// Table names are normalised with [`normalize_name`]. A `WITH` prefix is
/// looked through, so `WITH x AS (...) INSERT INTO t ...` is a write to `t`.
pub fn classify(sql: &str) -> StatementKind {
    let statements = match Parser::parse_sql(&SQLiteDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => return StatementKind::Unsupported(format!("statement could not be parsed: {e}")),
    };
    let [statement] = statements.as_slice() else {
        return StatementKind::Unsupported(format!(
            "expected exactly one statement, found {}",
            statements.len()
        ));
    };
    classify_statement(statement)
}

fn classify_statement(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(query) => match query.body.as_ref() {
            SetExpr::Insert(inner) | SetExpr::Update(inner) => classify_statement(inner),
            _ => StatementKind::Read,
        },
        Statement::Insert(insert) => write(WriteKind::Insert, &insert.table_name),
        Statement::Update { table, .. } => match relation(table) {
            Some(name) => write(WriteKind::Update, name),
            None => unsupported("UPDATE must target a single named table"),
        },
        Statement::Delete(delete) => {
            let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) =
                &delete.from;
            match tables.as_slice() {
                [only] => match relation(only) {
                    Some(name) => write(WriteKind::Delete, name),
                    None => unsupported("DELETE must target a single named table"),
                },
                _ => unsupported("DELETE must target a single named table"),
            }
        }
        Statement::CreateTable(create) => write(WriteKind::CreateTable, &create.name),
        Statement::CreateIndex(index) => write(WriteKind::CreateIndex, &index.table_name),
        Statement::Drop {
            object_type: ObjectType::Table,
            names,
            ..
        } => match names.as_slice() {
            [name] => write(WriteKind::DropTable, name),
            _ => unsupported("DROP TABLE must name a single table"),
        },
        Statement::AlterTable {
            name, operations, ..
        } => match operations.as_slice() {
            [AlterTableOperation::RenameTable { table_name }] => StatementKind::Rename {
                table: object_name(name),
                to: object_name(table_name),
            },
            ops if ops
                .iter()
                .any(|op| matches!(op, AlterTableOperation::RenameTable { .. })) =>
            {
                unsupported("a table rename must be the only ALTER TABLE operation")
            }
            _ => write(WriteKind::AlterTable, name),
        },
        _ => unsupported(
            "only queries, INSERT, UPDATE, DELETE and table or index DDL are accepted",
        ),
    }
}

fn write(kind: WriteKind, name: &ObjectName) -> StatementKind {
    StatementKind::Write {
        kind,
        table: object_name(name),
    }
}

fn unsupported(reason: &str) -> StatementKind {
    StatementKind::Unsupported(reason.to_string())
}

fn relation(table: &TableWithJoins) -> Option<&ObjectName> {
    match &table.relation {
        TableFactor::Table { name, .. } if table.joins.is_empty() => Some(name),
        _ => None,
    }
}

fn object_name(name: &ObjectName) -> String {
    normalize_name(&name.to_string())
}

/// Refuses statements that would write through the read path.
///
/// Statements the parser cannot place are left to the prepare-time guard,
/// which only lets read-only statements through.
pub(crate) fn ensure_read(sql: &str) -> Result<()> {
    if classify(sql).is_write() {
        return Err(DbError::Query(
            "write statements must go through execute_update with a declared table".to_string(),
        ));
    }
    Ok(())
}

/// Classifies a raw write and checks it against its declared target.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the statement is not a recognised
/// write, or if it writes a different table than `declared`.
pub(crate) fn check_declared_target(declared: &str, sql: &str) -> Result<StatementKind> {
    let kind = classify(sql);
    let declared_name = normalize_name(declared);
    match &kind {
        StatementKind::Write { table, .. } | StatementKind::Rename { table, .. } => {
            if *table != declared_name {
                return Err(DbError::Validation(format!(
                    "statement targets table '{table}' but '{declared}' was declared"
                )));
            }
        }
        StatementKind::Read => {
            return Err(DbError::Validation(format!(
                "statement declared for '{declared}' does not write"
            )));
        }
        StatementKind::Unsupported(reason) => {
            return Err(DbError::Validation(format!(
                "raw write to '{declared}' rejected: {reason}"
            )));
        }
    }
    Ok(kind)
}

/// Number of parameters a SQL fragment binds, following SQLite's rules:
/// `?` takes the next index, `?NNN` names an index explicitly, and each
/// distinct named parameter takes one index.
///
/// Placeholders inside literals, quoted identifiers and comments are not
/// counted.
pub(crate) fn parameter_count(sql: &str) -> Result<usize> {
    let tokens = Tokenizer::new(&SQLiteDialect {}, sql)
        .tokenize()
        .map_err(|e| DbError::Validation(format!("could not tokenize '{sql}': {e}")))?;

    let mut highest = 0usize;
    let mut named = HashSet::new();
    for token in tokens {
        let Token::Placeholder(text) = token else {
            continue;
        };
        match text.strip_prefix('?') {
            Some("") => highest += 1,
            Some(digits) => {
                let index: usize = digits.parse().map_err(|_| {
                    DbError::Validation(format!("invalid parameter '{text}' in '{sql}'"))
                })?;
                highest = highest.max(index);
            }
            None => {
                if named.insert(text) {
                    highest += 1;
                }
            }
        }
    }
    Ok(highest)
}

/// Strips identifier quoting and a schema prefix, then lowercases.
pub fn normalize_name(name: &str) -> String {
    let unquoted: String = name
        .chars()
        .filter(|c| !matches!(c, '"' | '`' | '[' | ']'))
        .collect();
    let bare = unquoted
        .rsplit_once('.')
        .map_or(unquoted.as_str(), |(_, table)| table);
    bare.to_ascii_lowercase()
}
