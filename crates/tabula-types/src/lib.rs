//! Shared types for the Tabula data-access layer.
//!
//! This crate holds the values that cross crate boundaries: tenant
//! identities, SQL values and rows, table metadata, migration records, and
//! the connection-pool lifecycle state. It performs no I/O and has no
//! database dependency, so host integrations can depend on it alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Maximum length of a tenant identity string.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Identity string reserved for the data-access layer itself.
pub const SYSTEM_TENANT: &str = "tabula:system";

/// Prefix of identities reserved for the data-access layer. Only
/// [`TenantId::system`] can produce one.
pub const RESERVED_TENANT_PREFIX: &str = "tabula:";

/// Errors produced when constructing shared types from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// The tenant identity was empty, too long, or contained forbidden characters.
    #[error("invalid tenant identity: {0}")]
    InvalidTenantId(String),
}

/// The identity of a tenant (an independent module sharing the database).
///
/// Identities are resolved once at the host integration boundary and then
/// carried explicitly on every call. Construction validates the shape so a
/// handle can never be opened with an empty or malformed identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant identity after validating it.
    ///
    /// Accepted characters are ASCII alphanumerics plus `_ . : -`; the value
    /// must be non-empty and at most [`MAX_TENANT_ID_LEN`] characters, and
    /// must not start with [`RESERVED_TENANT_PREFIX`].
    ///
    /// # Errors
    ///
    /// Returns [`TypeError::InvalidTenantId`] if the identity is malformed.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.is_empty() {
            return Err(TypeError::InvalidTenantId("identity is empty".to_string()));
        }
        if id.len() > MAX_TENANT_ID_LEN {
            return Err(TypeError::InvalidTenantId(format!(
                "identity exceeds {MAX_TENANT_ID_LEN} characters"
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
        {
            return Err(TypeError::InvalidTenantId(format!(
                "identity '{id}' contains forbidden characters"
            )));
        }
        let reserved = id
            .get(..RESERVED_TENANT_PREFIX.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(RESERVED_TENANT_PREFIX));
        if reserved {
            return Err(TypeError::InvalidTenantId(format!(
                "identity '{id}' uses the reserved '{RESERVED_TENANT_PREFIX}' prefix"
            )));
        }
        Ok(Self(id))
    }

    /// The reserved identity that owns internal tables such as
    /// `schema_migrations`.
    pub fn system() -> Self {
        Self(SYSTEM_TENANT.to_string())
    }

    /// Returns `true` if this is the reserved system identity.
    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_TENANT
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// A single SQL value, mirroring SQLite's storage classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the numeric payload as a float (integers are widened).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the text payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the blob payload, if any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A result row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Builds a [`Row`] from `(column, value)` pairs.
///
/// ```
/// use tabula_types::{row, Value};
///
/// let r = row([("name", Value::from("ada")), ("age", Value::from(36))]);
/// assert_eq!(r.len(), 2);
/// ```
pub fn row<K, I>(pairs: I) -> Row
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Column metadata reported by table introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type (may be empty for untyped SQLite columns).
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column accepts `NULL`.
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// Table metadata reported by table introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name as stored by the backend.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnInfo>,
}

/// A persisted record of an applied schema migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration version (primary key).
    pub version: i64,
    /// Human-readable description.
    pub description: String,
    /// When the migration committed (`YYYY-MM-DD HH:MM:SS`, UTC).
    pub applied_at: String,
    /// Wall-clock time spent applying the migration, in milliseconds.
    pub execution_time_ms: i64,
}

/// Lifecycle state of the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolStatus {
    /// No pool has been created yet.
    Uninitialized,
    /// The first pool is being created and tested.
    Initializing,
    /// The last health check succeeded.
    Healthy,
    /// The last health check failed and the pool could not be recovered.
    Unhealthy,
    /// The pool has been shut down; every further call fails.
    Closed,
}

impl PoolStatus {
    /// Returns a stable string label for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
