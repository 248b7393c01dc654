//! Operator intents applied to instances.

use serde::{Deserialize, Serialize};

/// An operation requested against one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Intent {
    /// Provision and start a pending instance.
    Create,
    /// Start a stopped instance.
    Start,
    /// Gracefully stop a running or degraded instance.
    Stop,
    /// Stop-then-start cycle.
    Restart,
    /// Adjust the compute units behind the instance.
    Scale { replicas: u32 },
    /// Tear the instance down.
    Destroy,
}

impl Intent {
    /// Stable fingerprint used for idempotent replay detection: the
    /// same fingerprint against an unchanged generation is a no-op.
    pub fn fingerprint(&self) -> String {
        match self {
            Intent::Create => "create".to_string(),
            Intent::Start => "start".to_string(),
            Intent::Stop => "stop".to_string(),
            Intent::Restart => "restart".to_string(),
            Intent::Scale { replicas } => format!("scale:{replicas}"),
            Intent::Destroy => "destroy".to_string(),
        }
    }

    /// Short name for logs and audit entries.
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Create => "create",
            Intent::Start => "start",
            Intent::Stop => "stop",
            Intent::Restart => "restart",
            Intent::Scale { .. } => "scale",
            Intent::Destroy => "destroy",
        }
    }
}
