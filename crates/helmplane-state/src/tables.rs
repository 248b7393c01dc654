//! redb table definitions for the helmplane state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types). Every key begins with the owning tenant id:
//! `{tenant_id}` for tenants themselves, `{tenant_id}/{entity_id}` for
//! everything else. Tenant scoping is therefore a key-prefix property.

use redb::TableDefinition;

/// Tenants keyed by `{tenant_id}`.
pub const TENANTS: TableDefinition<&str, &[u8]> = TableDefinition::new("tenants");

/// Instances keyed by `{tenant_id}/{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Deployments keyed by `{tenant_id}/{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Health records keyed by `{tenant_id}/{instance_id}`.
pub const HEALTH: TableDefinition<&str, &[u8]> = TableDefinition::new("health");

/// Audit entries keyed by `{tenant_id}/{audit_id}`.
pub const AUDIT: TableDefinition<&str, &[u8]> = TableDefinition::new("audit");
