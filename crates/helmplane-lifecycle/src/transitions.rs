//! The instance state transition graph.
//!
//! Transitions not present here are forbidden; the manager validates
//! every edge before touching the store, so arbitrary jumps cannot
//! happen even from buggy callers.

use helmplane_state::LifecycleState;

use crate::error::{LifecycleError, LifecycleResult};

/// States reachable from the given state.
pub fn allowed_transitions(from: LifecycleState) -> &'static [LifecycleState] {
    use LifecycleState::*;
    match from {
        Pending => &[Provisioning, Destroying],
        Provisioning => &[Starting, Failed],
        Starting => &[Running, Failed],
        Running => &[Degraded, Scaling, Stopping],
        Degraded => &[Running, Stopping, Failed],
        Scaling => &[Running, Failed],
        Stopping => &[Stopped, Failed],
        Stopped => &[Starting, Destroying],
        Failed => &[Destroying],
        Destroying => &[Destroyed, Failed],
        Destroyed => &[],
    }
}

/// Check whether moving from `from` to `to` is allowed.
pub fn validate_transition(
    from: LifecycleState,
    to: LifecycleState,
) -> LifecycleResult<()> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition { from, to })
    }
}
