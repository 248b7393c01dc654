//! Prefixed entity ids.
//!
//! Every domain object carries a string id of the form `{prefix}_{hex}`,
//! so an id is self-describing in logs and store keys.

use uuid::Uuid;

/// Entity type encoded into the id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Tenant,
    Instance,
    Deployment,
    Event,
    Audit,
}

impl IdPrefix {
    /// The short prefix string for this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Tenant => "tn",
            IdPrefix::Instance => "in",
            IdPrefix::Deployment => "dp",
            IdPrefix::Event => "ev",
            IdPrefix::Audit => "au",
        }
    }
}

/// Generate a fresh id for the given entity type.
pub fn new_id(prefix: IdPrefix) -> String {
    format!("{}_{}", prefix.as_str(), Uuid::new_v4().simple())
}
