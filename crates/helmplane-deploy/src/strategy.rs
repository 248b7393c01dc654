//! Strategy parameter validation and batch planning.

use helmplane_state::StrategyConfig;

use crate::error::{DeployError, DeployResult};

/// The default rolling configuration: one instance per batch.
pub fn default_rolling() -> StrategyConfig {
    StrategyConfig::Rolling { batch_size: 1 }
}

/// The default canary configuration: 10% canaries, 5% error budget.
pub fn default_canary() -> StrategyConfig {
    StrategyConfig::Canary {
        percent: 10,
        error_rate_threshold: 5.0,
    }
}

/// Validate strategy parameters before a deployment is admitted.
pub fn validate(strategy: &StrategyConfig) -> DeployResult<()> {
    match strategy {
        StrategyConfig::Rolling { batch_size } if *batch_size == 0 => Err(
            DeployError::Validation("rolling batch_size must be at least 1".to_string()),
        ),
        StrategyConfig::Canary { percent, .. } if *percent == 0 || *percent > 100 => Err(
            DeployError::Validation("canary percent must be within 1-100".to_string()),
        ),
        StrategyConfig::Canary {
            error_rate_threshold,
            ..
        } if !error_rate_threshold.is_finite() || *error_rate_threshold < 0.0 => {
            Err(DeployError::Validation(
                "canary error_rate_threshold must be a non-negative number".to_string(),
            ))
        }
        _ => Ok(()),
    }
}

/// Number of batches needed to cover `total` instances.
pub fn batch_count(total: u32, batch_size: u32) -> u32 {
    if batch_size == 0 {
        return 1;
    }
    total.div_ceil(batch_size)
}

/// Number of canary instances for a target count and percentage.
/// Always at least one.
pub fn canary_count(target: u32, percent: u32) -> u32 {
    ((target * percent).div_ceil(100)).max(1)
}
