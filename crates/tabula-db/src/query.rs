//! Fluent `SELECT` construction.
//!
//! A [`QueryBuilder`] accumulates columns, a source table, predicates and
//! paging, validating every identifier it is given. Validation failures are
//! remembered and reported by [`QueryBuilder::build`], so chains stay
//! readable and nothing reaches the database with a bad identifier.
//!
//! ```
//! use tabula_db::QueryBuilder;
//! use tabula_types::Value;
//!
//! let (sql, params) = QueryBuilder::new()
//!     .select(["id", "name"])
//!     .from("users")
//!     .where_clause("age > ?", [Value::from(18)])
//!     .limit(10)
//!     .build()
//!     .unwrap();
//! assert_eq!(sql, "SELECT id, name FROM users WHERE age > ? LIMIT 10");
//! assert_eq!(params, vec![Value::Integer(18)]);
//! ```

use crate::error::{DbError, Result};
use crate::identifier::{validate, validate_column, validate_table, IdentifierKind};
use crate::service::TenantHandle;
use crate::statement::parameter_count;
use tabula_types::{Row, Value};

/// Sort direction for `ORDER BY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Single-use builder for `SELECT` statements.
///
/// Builders obtained from [`TenantHandle::query_builder`] can also execute
/// themselves; standalone builders only render SQL.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    columns: Vec<String>,
    table: Option<String>,
    alias: Option<String>,
    where_clauses: Vec<String>,
    where_params: Vec<Value>,
    group_by: Vec<String>,
    having_clauses: Vec<String>,
    having_params: Vec<Value>,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
    error: Option<DbError>,
    executor: Option<TenantHandle>,
}

impl QueryBuilder {
    /// Creates an unbound builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bound(executor: TenantHandle) -> Self {
        Self {
            executor: Some(executor),
            ..Self::default()
        }
    }

    /// Adds columns to the select list.
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            self.check(validate_column(&column));
            self.columns.push(column);
        }
        self
    }

    /// Sets the source table.
    pub fn from(mut self, table: &str) -> Self {
        self.check(validate_table(table));
        self.table = Some(table.to_string());
        self
    }

    /// Sets the source table with an alias (`FROM table AS alias`).
    pub fn from_as(mut self, table: &str, alias: &str) -> Self {
        self.check(validate(alias, IdentifierKind::Table));
        self.alias = Some(alias.to_string());
        self.from(table)
    }

    /// Adds a `WHERE` predicate with its positional parameters.
    ///
    /// Multiple predicates are combined with `AND`.
    pub fn where_clause<P>(mut self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = Value>,
    {
        let params: Vec<Value> = params.into_iter().collect();
        self.check(check_parameters(predicate, params.len()));
        self.where_clauses.push(predicate.to_string());
        self.where_params.extend(params);
        self
    }

    /// Adds `GROUP BY` columns.
    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            let column = column.into();
            self.check(validate_column(&column));
            self.group_by.push(column);
        }
        self
    }

    /// Adds a `HAVING` predicate with its positional parameters.
    pub fn having<P>(mut self, predicate: &str, params: P) -> Self
    where
        P: IntoIterator<Item = Value>,
    {
        let params: Vec<Value> = params.into_iter().collect();
        self.check(check_parameters(predicate, params.len()));
        self.having_clauses.push(predicate.to_string());
        self.having_params.extend(params);
        self
    }

    /// Adds an `ORDER BY` term.
    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.check(validate_column(column));
        self.order_by.push(format!("{column} {}", order.as_sql()));
        self
    }

    /// Sets `LIMIT`.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets `OFFSET`.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Renders the statement and its parameters (where-parameters first,
    /// then having-parameters).
    ///
    /// # Errors
    ///
    /// Returns the first identifier or placeholder error recorded while
    /// building, or [`DbError::Validation`] if no columns or no table were set.
    pub fn build(&self) -> Result<(String, Vec<Value>)> {
        if let Some(err) = &self.error {
            return Err(DbError::Validation(strip_kind(err)));
        }
        if self.columns.is_empty() {
            return Err(DbError::Validation(
                "query has no select columns".to_string(),
            ));
        }
        let Some(table) = &self.table else {
            return Err(DbError::Validation("query has no source table".to_string()));
        };

        let mut sql = format!("SELECT {} FROM {table}", self.columns.join(", "));
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(alias);
        }
        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&join_predicates(&self.where_clauses));
        }
        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }
        if !self.having_clauses.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&join_predicates(&self.having_clauses));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut params = self.where_params.clone();
        params.extend(self.having_params.iter().cloned());
        // Numbered placeholders in one predicate can collide with another's.
        check_parameters(&sql, params.len())?;
        Ok((sql, params))
    }

    /// Renders the statement wrapped as a row count.
    pub fn build_count(&self) -> Result<(String, Vec<Value>)> {
        let (sql, params) = self.build()?;
        Ok((
            format!("SELECT COUNT(*) FROM ({sql}) AS count_query"),
            params,
        ))
    }

    /// Executes the query through the tenant handle it was created from.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Query`] if the builder is not bound to a handle,
    /// plus any build or execution error.
    pub async fn execute(self) -> Result<Vec<Row>> {
        let (sql, params) = self.build()?;
        self.executor()?.execute_query(&sql, params).await
    }

    /// Executes the query and returns the first row, if any.
    pub async fn execute_first(self) -> Result<Option<Row>> {
        Ok(self.execute().await?.into_iter().next())
    }

    /// Executes `SELECT COUNT(*)` over the query; `0` when no row comes back.
    pub async fn execute_count(self) -> Result<i64> {
        let (sql, params) = self.build_count()?;
        let rows = self.executor()?.execute_query(&sql, params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.values().next())
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    fn executor(&self) -> Result<&TenantHandle> {
        self.executor.as_ref().ok_or_else(|| {
            DbError::Query("query builder is not bound to a tenant handle".to_string())
        })
    }

    fn check(&mut self, result: Result<()>) {
        if let Err(err) = result {
            self.error.get_or_insert(err);
        }
    }
}

fn join_predicates(predicates: &[String]) -> String {
    if predicates.len() == 1 {
        return predicates[0].clone();
    }
    predicates
        .iter()
        .map(|p| format!("({p})"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Checks that `sql` binds exactly `supplied` parameters, numbering them the
/// way SQLite does: `?NNN` reuses a slot and text inside literals or
/// comments is ignored.
fn check_parameters(sql: &str, supplied: usize) -> Result<()> {
    let expected = parameter_count(sql)?;
    if expected != supplied {
        return Err(DbError::Validation(format!(
            "'{sql}' binds {expected} parameters but {supplied} were supplied"
        )));
    }
    Ok(())
}

fn strip_kind(err: &DbError) -> String {
    match err {
        DbError::Validation(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_basic_select() {
        let (sql, params) = QueryBuilder::new()
            .select(["id", "name"])
            .from("users")
            .where_clause("age > ?", [Value::from(18)])
            .limit(10)
            .build()
            .expect("query should build");
        assert_eq!(sql, "SELECT id, name FROM users WHERE age > ? LIMIT 10");
        assert_eq!(params, vec![Value::Integer(18)]);
    }

    #[test]
    fn renders_every_clause_in_order() {
        let (sql, params) = QueryBuilder::new()
            .select(["u.team", "COUNT(*) AS n"])
            .from_as("users", "u")
            .where_clause("u.active = ?", [Value::from(true)])
            .where_clause("u.age >= ?", [Value::from(21)])
            .group_by(["u.team"])
            .having("COUNT(*) > ?", [Value::from(2)])
            .order_by("n", Order::Desc)
            .limit(5)
            .offset(10)
            .build()
            .expect("query should build");
        assert_eq!(
            sql,
            "SELECT u.team, COUNT(*) AS n FROM users AS u \
             WHERE (u.active = ?) AND (u.age >= ?) GROUP BY u.team \
             HAVING COUNT(*) > ? ORDER BY n DESC LIMIT 5 OFFSET 10"
        );
        assert_eq!(
            params,
            vec![Value::Integer(1), Value::Integer(21), Value::Integer(2)]
        );
    }

    #[test]
    fn build_requires_columns_and_table() {
        let err = QueryBuilder::new().select(["id"]).build().expect_err("no table");
        assert!(matches!(err, DbError::Validation(_)));
        let err = QueryBuilder::new().from("users").build().expect_err("no columns");
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn invalid_identifiers_surface_at_build() {
        let err = QueryBuilder::new()
            .select(["id"])
            .from("users;DROP TABLE users")
            .build()
            .expect_err("bad table");
        assert!(err.to_string().contains("users;DROP TABLE users"));

        let err = QueryBuilder::new()
            .select(["id"])
            .from("users")
            .order_by("1bad", Order::Asc)
            .build()
            .expect_err("bad order column");
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn placeholder_count_must_match_parameters() {
        let err = QueryBuilder::new()
            .select(["*"])
            .from("users")
            .where_clause("a = ? AND b = ?", [Value::from(1)])
            .build()
            .expect_err("parameter count mismatch");
        assert!(matches!(err, DbError::Validation(_)));

        QueryBuilder::new()
            .select(["*"])
            .from("users")
            .where_clause("note = '?' AND id = ?", [Value::from(1)])
            .build()
            .expect("quoted question marks are not placeholders");

        let (_, params) = QueryBuilder::new()
            .select(["*"])
            .from("users")
            .where_clause("a = ?1 OR b = ?1", [Value::from(1)])
            .build()
            .expect("a numbered parameter used twice binds once");
        assert_eq!(params.len(), 1);

        QueryBuilder::new()
            .select(["*"])
            .from("users")
            .where_clause("a = ? /* or ? */ AND b = \"?\"", [Value::from(1)])
            .build()
            .expect("question marks in comments and quoted names are ignored");

        let err = QueryBuilder::new()
            .select(["*"])
            .from("users")
            .where_clause("a = ?", [Value::from(1)])
            .where_clause("b = ?1", [Value::from(2)])
            .build()
            .expect_err("second predicate rebinds the first slot");
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn count_wraps_query() {
        let (sql, _) = QueryBuilder::new()
            .select(["id"])
            .from("users")
            .build_count()
            .expect("query should build");
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM (SELECT id FROM users) AS count_query"
        );
    }

    #[tokio::test]
    async fn unbound_builder_cannot_execute() {
        let err = QueryBuilder::new()
            .select(["id"])
            .from("users")
            .execute()
            .await
            .expect_err("unbound builder");
        assert!(matches!(err, DbError::Query(_)));
    }
}
