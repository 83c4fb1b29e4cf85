//! Provider registry
//!
//! Named factories per capability. Drivers register under `(kind, name)`;
//! creation with an unknown pair fails deterministically.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use edgevoice_config::ProviderEntry;
use edgevoice_core::{ProviderInstance, ProviderKind};

use crate::ProviderError;

/// Builds one instance from its config entry.
pub type ProviderFactory =
    Arc<dyn Fn(&ProviderEntry) -> Result<ProviderInstance, ProviderError> + Send + Sync>;

#[derive(Default)]
pub struct ProviderRegistry {
    factories: RwLock<HashMap<(ProviderKind, String), ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: ProviderKind, name: impl Into<String>, factory: F)
    where
        F: Fn(&ProviderEntry) -> Result<ProviderInstance, ProviderError> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(%kind, name, "registered provider factory");
        self.factories
            .write()
            .insert((kind, name), Arc::new(factory));
    }

    /// Instantiate `(kind, name)` from its config entry.
    pub fn create(
        &self,
        kind: ProviderKind,
        name: &str,
        entry: &ProviderEntry,
    ) -> Result<ProviderInstance, ProviderError> {
        let factory = self
            .factories
            .read()
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider {
                kind,
                name: name.to_string(),
            })?;

        let instance = factory(entry)?;
        if instance.kind() != kind {
            return Err(ProviderError::Factory(format!(
                "factory for {kind}/{name} produced a {} instance",
                instance.kind()
            )));
        }
        Ok(instance)
    }

    pub fn names(&self, kind: ProviderKind) -> Vec<String> {
        self.factories
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use edgevoice_core::{AudioFrame, Provider, VadEngine};

    struct NullVad;

    #[async_trait]
    impl Provider for NullVad {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Vad
        }
    }

    impl VadEngine for NullVad {
        fn process_frame(&self, _frame: &AudioFrame) -> edgevoice_core::Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn create_known_provider() {
        let registry = ProviderRegistry::new();
        registry.register(ProviderKind::Vad, "null", |_entry| {
            Ok(ProviderInstance::Vad(Arc::new(NullVad)))
        });

        let instance = registry
            .create(ProviderKind::Vad, "null", &ProviderEntry::default())
            .unwrap();
        assert_eq!(instance.kind(), ProviderKind::Vad);
    }

    #[test]
    fn unknown_name_fails_deterministically() {
        let registry = ProviderRegistry::new();
        let err = registry
            .create(ProviderKind::Asr, "ghost", &ProviderEntry::default())
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider { .. }));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let registry = ProviderRegistry::new();
        registry.register(ProviderKind::Asr, "bad", |_entry| {
            Ok(ProviderInstance::Vad(Arc::new(NullVad)))
        });
        let err = registry
            .create(ProviderKind::Asr, "bad", &ProviderEntry::default())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Factory(_)));
    }
}
