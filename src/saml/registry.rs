//! Registry of initialized SAML providers, keyed by provider id.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{info, warn};

use super::config::SamlConfig;
use super::error::RegistryError;
use super::provider::SamlProvider;

/// Providers are fully built before insertion, so readers never see a
/// partially initialized one.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<SamlProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize every enabled provider.
    ///
    /// A provider that fails is logged and skipped. The registry only fails
    /// when no provider initializes.
    pub async fn initialize(config: &SamlConfig) -> Result<Self, RegistryError> {
        let registry = Self::new();
        let mut failures = Vec::new();

        for provider_config in config.enabled_providers() {
            let id = provider_config.id.clone();
            match SamlProvider::initialize(provider_config.clone()).await {
                Ok(provider) => registry.insert(provider),
                Err(e) => {
                    warn!(provider = %id, error = %format!("{:#}", e), "SAML provider failed to initialize");
                    failures.push((id, format!("{:#}", e)));
                }
            }
        }

        if registry.is_empty() {
            if failures.is_empty() {
                return Err(RegistryError::NoProviders);
            }
            return Err(RegistryError::AllProvidersFailed(failures));
        }

        info!(
            providers = registry.len(),
            failed = failures.len(),
            "SAML provider registry initialized"
        );
        Ok(registry)
    }

    /// Add or replace a provider.
    pub fn insert(&self, provider: SamlProvider) {
        let id = provider.id().to_string();
        self.write().insert(id, Arc::new(provider));
    }

    pub fn get(&self, id: &str) -> Option<Arc<SamlProvider>> {
        self.read().get(id).cloned()
    }

    /// Provider ids in sorted order.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Providers are immutable, so a poisoned map is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<SamlProvider>>> {
        self.providers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<SamlProvider>>> {
        self.providers.write().unwrap_or_else(|e| e.into_inner())
    }
}
