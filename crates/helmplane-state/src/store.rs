//! StateStore — redb-backed persistence for the control plane.
//!
//! Provides typed CRUD over tenants, instances, deployments, health
//! records, and audit entries. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Every accessor below takes the tenant id and builds the key prefix
//! from it; there is no method that scans across tenants except the
//! garbage-collection sweep, which never returns records to callers.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TENANTS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(HEALTH).map_err(map_err!(Table))?;
        txn.open_table(AUDIT).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic insert into one of the `&str → &[u8]` tables.
    fn put<T: serde::Serialize>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Generic point lookup from one of the `&str → &[u8]` tables.
    fn get<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Generic prefix scan over one of the `&str → &[u8]` tables.
    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let parsed: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(parsed);
            }
        }
        Ok(results)
    }

    /// Generic delete. Returns true if the key existed.
    fn delete(
        &self,
        table: redb::TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Tenants ────────────────────────────────────────────────────

    /// Insert or update a tenant.
    pub fn put_tenant(&self, tenant: &Tenant) -> StateResult<()> {
        self.put(TENANTS, &tenant.id, tenant)?;
        debug!(tenant = %tenant.id, "tenant stored");
        Ok(())
    }

    /// Get a tenant by id.
    pub fn get_tenant(&self, tenant_id: &str) -> StateResult<Option<Tenant>> {
        self.get(TENANTS, tenant_id)
    }

    /// List all tenants.
    pub fn list_tenants(&self) -> StateResult<Vec<Tenant>> {
        self.scan_prefix(TENANTS, "")
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance unconditionally.
    ///
    /// Prefer [`StateStore::cas_instance`] for state transitions; this
    /// is for initial creation and fields outside the transition race.
    pub fn put_instance(&self, instance: &Instance) -> StateResult<()> {
        self.put(INSTANCES, &instance.table_key(), instance)
    }

    /// Get an instance by tenant and id.
    pub fn get_instance(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<Instance>> {
        self.get(INSTANCES, &format!("{tenant_id}/{instance_id}"))
    }

    /// List all instances for a tenant.
    pub fn list_instances(&self, tenant_id: &str) -> StateResult<Vec<Instance>> {
        self.scan_prefix(INSTANCES, &format!("{tenant_id}/"))
    }

    /// List a tenant's instances belonging to a service.
    pub fn list_instances_for_service(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> StateResult<Vec<Instance>> {
        let mut instances = self.list_instances(tenant_id)?;
        instances.retain(|i| i.service == service);
        Ok(instances)
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, tenant_id: &str, instance_id: &str) -> StateResult<bool> {
        self.delete(INSTANCES, &format!("{tenant_id}/{instance_id}"))
    }

    /// Atomic conditional update of an instance.
    ///
    /// The write succeeds only if the stored record still has the
    /// expected `(state, generation)` pair; otherwise a `Conflict`
    /// error is returned and the caller must re-read and retry. This
    /// is the lost-update guard for racing health-driven and
    /// operator-driven transitions.
    pub fn cas_instance(
        &self,
        updated: &Instance,
        expected_state: LifecycleState,
        expected_generation: u64,
    ) -> StateResult<()> {
        let key = updated.table_key();
        let bytes = serde_json::to_vec(updated).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Instance = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(key)),
            };
            if current.state != expected_state || current.generation != expected_generation {
                return Err(StateError::Conflict(format!(
                    "instance {key}: expected ({expected_state}, gen {expected_generation}), \
                     found ({}, gen {})",
                    current.state, current.generation
                )));
            }
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Remove destroyed instances whose retention window has elapsed.
    ///
    /// Sweeps every tenant; returns the number of records removed.
    /// Associated health records are removed with the instance.
    pub fn gc_destroyed(&self, destroyed_before: u64) -> StateResult<u32> {
        // Collect expired keys in a read transaction first.
        let expired: Vec<(String, String)> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let instance: Instance =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if instance.state == LifecycleState::Destroyed
                    && instance.destroyed_at.is_some_and(|t| t < destroyed_before)
                {
                    keys.push((key.value().to_string(), key.value().to_string()));
                }
            }
            keys
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = expired.len() as u32;
        {
            let mut instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let mut health = txn.open_table(HEALTH).map_err(map_err!(Table))?;
            for (instance_key, health_key) in &expired {
                instances
                    .remove(instance_key.as_str())
                    .map_err(map_err!(Write))?;
                health.remove(health_key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            debug!(count, "destroyed instances garbage-collected");
        }
        Ok(count)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &deployment.table_key(), deployment)
    }

    /// Get a deployment by tenant and id.
    pub fn get_deployment(
        &self,
        tenant_id: &str,
        deployment_id: &str,
    ) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, &format!("{tenant_id}/{deployment_id}"))
    }

    /// List all deployments for a tenant.
    pub fn list_deployments(&self, tenant_id: &str) -> StateResult<Vec<Deployment>> {
        self.scan_prefix(DEPLOYMENTS, &format!("{tenant_id}/"))
    }

    /// Find the active (pending or in-progress) deployment for a
    /// service, if one exists. At most one is ever active per
    /// `(tenant, service)` pair.
    pub fn active_deployment_for_service(
        &self,
        tenant_id: &str,
        service: &str,
    ) -> StateResult<Option<Deployment>> {
        let deployments = self.list_deployments(tenant_id)?;
        Ok(deployments
            .into_iter()
            .find(|d| d.service == service && d.state.is_active()))
    }

    // ── Health records ─────────────────────────────────────────────

    /// Insert or update an instance's health record (superseding the
    /// previous one).
    pub fn put_health(&self, record: &HealthRecord) -> StateResult<()> {
        self.put(HEALTH, &record.table_key(), record)
    }

    /// Get the health record for an instance.
    pub fn get_health(
        &self,
        tenant_id: &str,
        instance_id: &str,
    ) -> StateResult<Option<HealthRecord>> {
        self.get(HEALTH, &format!("{tenant_id}/{instance_id}"))
    }

    /// Delete the health record for an instance. Returns true if it existed.
    pub fn delete_health(&self, tenant_id: &str, instance_id: &str) -> StateResult<bool> {
        self.delete(HEALTH, &format!("{tenant_id}/{instance_id}"))
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Append an audit entry.
    pub fn append_audit(&self, entry: &AuditEntry) -> StateResult<()> {
        self.put(AUDIT, &entry.table_key(), entry)
    }

    /// List audit entries for a tenant, newest-keyed last, up to `limit`.
    pub fn list_audit(&self, tenant_id: &str, limit: usize) -> StateResult<Vec<AuditEntry>> {
        let mut entries: Vec<AuditEntry> =
            self.scan_prefix(AUDIT, &format!("{tenant_id}/"))?;
        entries.sort_by_key(|e| e.created_at);
        if entries.len() > limit {
            let excess = entries.len() - limit;
            entries.drain(..excess);
        }
        Ok(entries)
    }
}
