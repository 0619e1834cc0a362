//! Statement execution on a single connection.
//!
//! These functions are shared by [`crate::DataService`] (one pooled
//! connection per call) and [`crate::TxScope`] (one connection for the
//! whole transaction). Identifiers are validated and quoted here; values are
//! always bound as parameters. Every statement is prepared under an
//! [`AccessGuard`], so a caller-supplied fragment can never widen what the
//! statement touches.

use crate::error::{DbError, Result};
use crate::guard::{Access, AccessGuard};
use crate::identifier::{quote, quote_column_name, quote_table, validate_table};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use tabula_types::{ColumnInfo, Row, TableInfo, Value};

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

fn bind(params: &[Value]) -> impl Iterator<Item = SqlValue> + '_ {
    params.iter().map(to_sql)
}

/// Runs a read statement and maps every row to column-name keyed values.
pub(crate) fn query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
    let guard = AccessGuard::install(conn, Access::Read);
    let mut stmt = guard.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let mut rows = stmt
        .query(params_from_iter(bind(params)))
        .map_err(|e| guard.failed("query", &e))?;

    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| DbError::query("read row", "statement", &e))?
    {
        let mut mapped = Row::new();
        for (idx, name) in names.iter().enumerate() {
            let value = row
                .get_ref(idx)
                .map_err(|e| DbError::query("read column", name, &e))?;
            mapped.insert(name.clone(), from_sql(value));
        }
        out.push(mapped);
    }
    Ok(out)
}

/// Runs one write statement that may only write `target`, and returns the
/// affected row count.
pub(crate) fn execute(conn: &Connection, target: &str, sql: &str, params: &[Value]) -> Result<usize> {
    let guard = AccessGuard::install(conn, Access::Write(target));
    let mut stmt = guard.prepare(sql)?;
    let changed = stmt
        .execute(params_from_iter(bind(params)))
        .map_err(|e| guard.failed("execute", &e))?;
    Ok(changed)
}

pub(crate) fn create_table(conn: &Connection, table: &str, schema: &str) -> Result<()> {
    let sql = format!("CREATE TABLE IF NOT EXISTS {} ({schema})", quote_table(table)?);
    execute(conn, table, &sql, &[]).map(|_| ())
}

pub(crate) fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    let sql = format!("DROP TABLE IF EXISTS {}", quote_table(table)?);
    execute(conn, table, &sql, &[]).map(|_| ())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    validate_table(table)?;
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE)",
        [table],
        |row| row.get(0),
    )
    .map_err(|e| DbError::query("lookup", table, &e))
}

pub(crate) fn table_info(conn: &Connection, table: &str) -> Result<Option<TableInfo>> {
    validate_table(table)?;
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            [table],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DbError::query("lookup", table, &e))?;
    let Some(name) = name else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_table(&name)?))
        .map_err(|e| DbError::query("describe", table, &e))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                data_type: row.get(2)?,
                nullable: row.get::<_, i64>(3)? == 0,
                primary_key: row.get::<_, i64>(5)? > 0,
            })
        })
        .map_err(|e| DbError::query("describe", table, &e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DbError::query("describe", table, &e))?;

    Ok(Some(TableInfo { name, columns }))
}

/// Inserts one row and returns its rowid.
pub(crate) fn insert(conn: &Connection, table: &str, row: &Row) -> Result<i64> {
    if row.is_empty() {
        return Err(DbError::Validation(format!(
            "insert into '{table}' has no columns"
        )));
    }
    let columns = row
        .keys()
        .map(|c| quote_column_name(c))
        .collect::<Result<Vec<_>>>()?;
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        quote_table(table)?,
        columns.join(", ")
    );
    let values: Vec<Value> = row.values().cloned().collect();
    execute(conn, table, &sql, &values)?;
    Ok(conn.last_insert_rowid())
}

/// Updates rows matching `where_sql`; `SET` values bind before `params`.
pub(crate) fn update(
    conn: &Connection,
    table: &str,
    row: &Row,
    where_sql: &str,
    params: &[Value],
) -> Result<usize> {
    if row.is_empty() {
        return Err(DbError::Validation(format!(
            "update of '{table}' has no columns"
        )));
    }
    let assignments = row
        .keys()
        .map(|c| quote_column_name(c).map(|q| format!("{q} = ?")))
        .collect::<Result<Vec<_>>>()?;
    let mut sql = format!(
        "UPDATE {} SET {}",
        quote_table(table)?,
        assignments.join(", ")
    );
    push_where(&mut sql, where_sql);
    let mut values: Vec<Value> = row.values().cloned().collect();
    values.extend_from_slice(params);
    execute(conn, table, &sql, &values)
}

pub(crate) fn delete(conn: &Connection, table: &str, where_sql: &str, params: &[Value]) -> Result<usize> {
    let mut sql = format!("DELETE FROM {}", quote_table(table)?);
    push_where(&mut sql, where_sql);
    execute(conn, table, &sql, params)
}

pub(crate) fn select(
    conn: &Connection,
    table: &str,
    columns: &[String],
    where_sql: Option<&str>,
    params: &[Value],
) -> Result<Vec<Row>> {
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| quote(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };
    let mut sql = format!("SELECT {projection} FROM {}", quote_table(table)?);
    if let Some(where_sql) = where_sql {
        push_where(&mut sql, where_sql);
    }
    query(conn, &sql, params)
}

fn push_where(sql: &mut String, where_sql: &str) {
    let where_sql = where_sql.trim();
    if !where_sql.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(where_sql);
    }
}
