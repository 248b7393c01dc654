//! Quota accounting and admission checks.

use helmplane_state::{Quota, StateResult, StateStore};

use crate::error::{ControlError, ControlResult};

/// Point-in-time usage against a tenant's quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Instances in non-terminal states.
    pub instances: u32,
    /// Deployments pending or in progress.
    pub active_deployments: u32,
    /// Memory reserved across counted instances (MB).
    pub memory_mb: u64,
    /// CPU reserved across counted instances (millicores).
    pub cpu_millis: u64,
}

/// Compute current usage for a tenant.
pub fn usage(state: &StateStore, tenant_id: &str) -> StateResult<QuotaUsage> {
    let mut snapshot = QuotaUsage {
        instances: 0,
        active_deployments: 0,
        memory_mb: 0,
        cpu_millis: 0,
    };
    for instance in state.list_instances(tenant_id)? {
        if instance.state.counts_against_quota() {
            snapshot.instances += 1;
            snapshot.memory_mb +=
                instance.spec.resources.memory_mb * u64::from(instance.spec.replicas);
            snapshot.cpu_millis +=
                instance.spec.resources.cpu_millis * u64::from(instance.spec.replicas);
        }
    }
    for deployment in state.list_deployments(tenant_id)? {
        if deployment.state.is_active() {
            snapshot.active_deployments += 1;
        }
    }
    Ok(snapshot)
}

/// Admission check for `additional` new instances.
pub fn check_instances(
    quota: &Quota,
    current: &QuotaUsage,
    additional: u32,
) -> ControlResult<()> {
    if current.instances + additional > quota.max_instances {
        return Err(ControlError::QuotaExceeded(format!(
            "instances: {} in use, {additional} requested, limit {}",
            current.instances, quota.max_instances
        )));
    }
    Ok(())
}

/// Admission check for one more concurrent deployment.
pub fn check_deployments(quota: &Quota, current: &QuotaUsage) -> ControlResult<()> {
    if current.active_deployments + 1 > quota.max_concurrent_deploys {
        return Err(ControlError::QuotaExceeded(format!(
            "deployments: {} active, limit {}",
            current.active_deployments, quota.max_concurrent_deploys
        )));
    }
    Ok(())
}
