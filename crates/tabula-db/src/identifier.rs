//! SQL identifier validation and quoting.
//!
//! Simple identifiers must match `^[A-Za-z_][A-Za-z0-9_]*$` and be at most
//! [`MAX_IDENTIFIER_LEN`] characters. Column references that are the `*`
//! wildcard, qualified (`t.col`), aliased (`col AS c`), or expressions
//! (`COUNT(*)`) are passed through untouched so callers can still write
//! them; only simple names are validated and quoted.

use crate::error::{DbError, Result};

/// Longest identifier accepted, matching the common backend limit.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// What an identifier names. Only columns get the expression exemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Table,
    Column,
}

impl IdentifierKind {
    fn label(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Column => "column",
        }
    }
}

/// Returns `true` if a column reference is exempt from validation.
pub fn is_column_expression(column: &str) -> bool {
    column == "*" || column.contains(['.', ' ', '('])
}

/// Returns `true` if `identifier` is a valid simple identifier.
pub fn is_simple_identifier(identifier: &str) -> bool {
    let mut chars = identifier.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    identifier.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates an identifier of the given kind.
///
/// # Errors
///
/// Returns [`DbError::Validation`] naming the identifier if it is empty,
/// too long, or contains characters outside `[A-Za-z0-9_]`.
pub fn validate(identifier: &str, kind: IdentifierKind) -> Result<()> {
    if kind == IdentifierKind::Column && is_column_expression(identifier) {
        return Ok(());
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::Validation(format!(
            "{} name '{}' exceeds {MAX_IDENTIFIER_LEN} characters",
            kind.label(),
            truncate_for_message(identifier)
        )));
    }
    if !is_simple_identifier(identifier) {
        return Err(DbError::Validation(format!(
            "invalid {} name '{}'",
            kind.label(),
            truncate_for_message(identifier)
        )));
    }
    Ok(())
}

/// Validates a table name.
pub fn validate_table(table: &str) -> Result<()> {
    validate(table, IdentifierKind::Table)
}

/// Validates a column reference.
pub fn validate_column(column: &str) -> Result<()> {
    validate(column, IdentifierKind::Column)
}

/// Validates and double-quotes a simple identifier.
///
/// Column expressions (see [`is_column_expression`]) are returned as-is.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the identifier is invalid.
pub fn quote(identifier: &str) -> Result<String> {
    if is_column_expression(identifier) {
        return Ok(identifier.to_string());
    }
    validate(identifier, IdentifierKind::Column)?;
    Ok(format!("\"{identifier}\""))
}

/// Validates and quotes a table name. Tables never get the expression exemption.
pub fn quote_table(table: &str) -> Result<String> {
    validate_table(table)?;
    Ok(format!("\"{table}\""))
}

/// Validates and quotes a column name that must be a simple identifier,
/// as in `INSERT` column lists and `UPDATE ... SET` targets.
pub fn quote_column_name(column: &str) -> Result<String> {
    if !is_simple_identifier(column) {
        return Err(DbError::Validation(format!(
            "invalid column name '{}'",
            truncate_for_message(column)
        )));
    }
    Ok(format!("\"{column}\""))
}

fn truncate_for_message(identifier: &str) -> String {
    identifier.chars().take(MAX_IDENTIFIER_LEN + 1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_identifiers() {
        let longest = "x".repeat(MAX_IDENTIFIER_LEN);
        for name in ["users", "_private", "Table_2", "a", longest.as_str()] {
            validate_table(name).unwrap_or_else(|e| panic!("{name} should be valid: {e}"));
            validate_column(name).unwrap_or_else(|e| panic!("{name} should be valid: {e}"));
        }
    }

    #[test]
    fn rejects_malformed_identifiers() {
        let too_long = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        for name in ["", "1users", "users;drop", "bad-name", "naïve", too_long.as_str()] {
            let err = validate_table(name).expect_err("should be rejected");
            assert!(matches!(err, DbError::Validation(_)), "{name}: {err}");
        }
    }

    #[test]
    fn column_expressions_are_exempt_and_unquoted() {
        for expr in ["*", "u.name", "COUNT(*)", "name AS n", "max(age)"] {
            validate_column(expr).expect("expressions pass through");
            assert_eq!(quote(expr).expect("quote is a no-op"), expr);
        }
    }

    #[test]
    fn tables_do_not_get_expression_exemption() {
        assert!(validate_table("a.b").is_err());
        assert!(validate_table("*").is_err());
        assert!(quote_table("users; DROP TABLE x").is_err());
    }

    #[test]
    fn quote_wraps_simple_names() {
        assert_eq!(quote("name").expect("valid"), "\"name\"");
        assert_eq!(quote_table("users").expect("valid"), "\"users\"");
        assert!(quote("na\"me").is_err());
    }

    #[test]
    fn write_column_names_get_no_exemption() {
        assert_eq!(quote_column_name("age").expect("valid"), "\"age\"");
        assert!(quote_column_name("a) VALUES (1); --").is_err());
        assert!(quote_column_name("t.col").is_err());
    }

    #[test]
    fn error_message_names_identifier() {
        let err = validate_table("bad;name").expect_err("should be rejected");
        assert!(err.to_string().contains("bad;name"));
    }
}
