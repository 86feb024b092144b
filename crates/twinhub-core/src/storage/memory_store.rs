//! In-memory model store for testing and development

use crate::model::ModelDefinition;
use crate::storage::{ModelStore, StoredProvider};
use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// In-memory model store (non-persistent)
#[derive(Clone)]
pub struct MemoryModelStore {
    models: Arc<DashMap<(String, String), ModelDefinition>>,
    providers: Arc<DashMap<String, StoredProvider>>,
}

impl MemoryModelStore {
    /// Create a new in-memory model store
    pub fn new() -> Self {
        Self {
            models: Arc::new(DashMap::new()),
            providers: Arc::new(DashMap::new()),
        }
    }
}

impl Default for MemoryModelStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn save_model(&self, definition: &ModelDefinition) -> Result<()> {
        self.models.insert(
            (definition.namespace.clone(), definition.name.clone()),
            definition.clone(),
        );
        Ok(())
    }

    async fn load_model(&self, namespace: &str, name: &str) -> Result<Option<ModelDefinition>> {
        Ok(self
            .models
            .get(&(namespace.to_string(), name.to_string()))
            .map(|d| d.clone()))
    }

    async fn delete_model(&self, namespace: &str, name: &str) -> Result<()> {
        self.models
            .remove(&(namespace.to_string(), name.to_string()));
        self.providers
            .retain(|_, p| !(p.namespace == namespace && p.model == name));
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDefinition>> {
        Ok(self.models.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_provider(&self, provider: &StoredProvider) -> Result<()> {
        let model_key = (provider.namespace.clone(), provider.model.clone());
        if !self.models.contains_key(&model_key) {
            bail!(
                "provider {} references unsaved model {}/{}",
                provider.name,
                provider.namespace,
                provider.model
            );
        }
        self.providers
            .insert(provider.name.clone(), provider.clone());
        Ok(())
    }

    async fn delete_provider(&self, name: &str) -> Result<()> {
        self.providers.remove(name);
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<StoredProvider>> {
        Ok(self.providers.iter().map(|e| e.value().clone()).collect())
    }
}
