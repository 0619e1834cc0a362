//! Table ownership registry and write-access gate.
//!
//! A table is owned by the tenant that created it. Unclaimed tables may be
//! written by anyone; owned tables only by their owner. Reads never consult
//! the registry. Names are normalised to lowercase, matching SQLite's
//! case-insensitive identifiers.

use crate::error::{DbError, Result};
use crate::sync;
use std::collections::HashMap;
use std::sync::Mutex;
use tabula_types::TenantId;

/// Process-lifetime map of table name to owning tenant.
#[derive(Debug, Default)]
pub struct OwnershipRegistry {
    owners: Mutex<HashMap<String, TenantId>>,
}

impl OwnershipRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the owner of `table`, if claimed.
    pub fn owner(&self, table: &str) -> Option<TenantId> {
        sync::lock(&self.owners, "ownership registry")
            .get(&normalize(table))
            .cloned()
    }

    /// Returns `true` if `tenant` owns `table`.
    pub fn is_owner(&self, table: &str, tenant: &TenantId) -> bool {
        self.owner(table).as_ref() == Some(tenant)
    }

    /// Applies the write gate: allowed when unclaimed or owned by `tenant`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Query`] naming the real owner when denied.
    pub fn check_write(&self, table: &str, tenant: &TenantId) -> Result<()> {
        match self.owner(table) {
            Some(owner) if &owner != tenant => {
                tracing::warn!(
                    table,
                    tenant = %tenant,
                    owner = %owner,
                    "write denied by table ownership"
                );
                Err(DbError::ownership_denied(table, owner.as_str()))
            }
            _ => Ok(()),
        }
    }

    /// Claims `table` for `tenant` if it is unclaimed.
    ///
    /// Claiming a table already owned by the same tenant is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Query`] if another tenant claimed it first.
    pub fn claim(&self, table: &str, tenant: &TenantId) -> Result<()> {
        let mut owners = sync::lock(&self.owners, "ownership registry");
        let owner = owners
            .entry(normalize(table))
            .or_insert_with(|| tenant.clone());
        if *owner != *tenant {
            return Err(DbError::ownership_denied(table, owner.as_str()));
        }
        tracing::debug!(table, tenant = %tenant, "table ownership claimed");
        Ok(())
    }

    /// Forgets the owner of `table` (after it was dropped).
    pub fn release(&self, table: &str) {
        if let Some(owner) = sync::lock(&self.owners, "ownership registry").remove(&normalize(table)) {
            tracing::debug!(table, owner = %owner, "table ownership released");
        }
    }

    /// Moves the claim on `from` to `to` after the table was renamed.
    /// An unclaimed table stays unclaimed under its new name.
    pub fn rename(&self, from: &str, to: &str) {
        let mut owners = sync::lock(&self.owners, "ownership registry");
        if let Some(owner) = owners.remove(&normalize(from)) {
            tracing::debug!(from, to, owner = %owner, "table ownership moved");
            owners.insert(normalize(to), owner);
        }
    }

    /// Number of claimed tables.
    pub fn len(&self) -> usize {
        sync::lock(&self.owners, "ownership registry").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalize(table: &str) -> String {
    table.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).expect("valid tenant")
    }

    #[test]
    fn unclaimed_tables_are_writable_by_anyone() {
        let registry = OwnershipRegistry::new();
        registry.check_write("u", &tenant("a")).expect("unclaimed");
        registry.check_write("u", &tenant("b")).expect("unclaimed");
        assert!(registry.owner("u").is_none());
    }

    #[test]
    fn owner_may_write_others_may_not() {
        let registry = OwnershipRegistry::new();
        registry.claim("Orders", &tenant("a")).expect("claim");
        registry.check_write("orders", &tenant("a")).expect("owner writes");
        let err = registry.check_write("ORDERS", &tenant("b")).expect_err("non-owner");
        assert!(matches!(err, DbError::Query(_)));
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn claim_is_first_writer_wins() {
        let registry = OwnershipRegistry::new();
        registry.claim("t", &tenant("a")).expect("first claim");
        registry.claim("t", &tenant("a")).expect("reclaim by owner");
        registry.claim("t", &tenant("b")).expect_err("second tenant");
        assert!(registry.is_owner("t", &tenant("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rename_moves_the_claim() {
        let registry = OwnershipRegistry::new();
        registry.claim("Drafts", &tenant("a")).expect("claim");
        registry.rename("drafts", "Published");
        assert!(registry.owner("drafts").is_none());
        assert!(registry.is_owner("published", &tenant("a")));
        registry.check_write("published", &tenant("b")).expect_err("still owned");

        registry.rename("loose", "elsewhere");
        assert!(registry.owner("elsewhere").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn release_makes_table_unclaimed() {
        let registry = OwnershipRegistry::new();
        registry.claim("t", &tenant("a")).expect("claim");
        registry.release("T");
        assert!(registry.is_empty());
        registry.check_write("t", &tenant("b")).expect("unclaimed again");
    }
}
