//! Provider registry — named backends selected by configuration.
//!
//! Built once at startup and passed by reference into the facade;
//! there is no process-wide mutable registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Provider;

/// Immutable map of provider name → implementation.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name. Replaces any previous
    /// registration with the same name.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> ProviderResult<Arc<dyn Provider>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// Names of all registered providers.
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;

    #[test]
    fn register_and_get() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::new("mock")));

        assert!(registry.get("mock").is_ok());
        assert_eq!(registry.names(), vec!["mock".to_string()]);
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let registry = ProviderRegistry::new();
        let result = registry.get("fly");
        assert!(matches!(result, Err(ProviderError::UnknownProvider(_))));
    }
}
