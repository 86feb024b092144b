//! `Sled`-based model store implementation
//!
//! Uses an embedded database for persistent schema storage.

use crate::model::ModelDefinition;
use crate::storage::{ModelStore, StoredProvider};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sled::{Db, Tree};

/// `Sled`-based persistent model store
pub struct SledModelStore {
    db: Db,
    models: Tree,
    providers: Tree,
}

impl SledModelStore {
    /// Create a new `Sled` model store
    pub fn new(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(|e| anyhow!(e))?;
        let models = db.open_tree("models").map_err(|e| anyhow!(e))?;
        let providers = db.open_tree("providers").map_err(|e| anyhow!(e))?;

        Ok(Self {
            db,
            models,
            providers,
        })
    }

    fn model_key(namespace: &str, name: &str) -> Vec<u8> {
        format!("{namespace}/{name}").into_bytes()
    }
}

#[async_trait]
impl ModelStore for SledModelStore {
    async fn save_model(&self, definition: &ModelDefinition) -> Result<()> {
        let key = Self::model_key(&definition.namespace, &definition.name);
        let encoded = bincode::serde::encode_to_vec(definition, bincode::config::standard())
            .map_err(|e| anyhow!(e))?;

        self.models.insert(key, encoded).map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn load_model(&self, namespace: &str, name: &str) -> Result<Option<ModelDefinition>> {
        let key = Self::model_key(namespace, name);

        if let Some(data) = self.models.get(key).map_err(|e| anyhow!(e))? {
            let definition = bincode::serde::decode_from_slice(&data, bincode::config::standard())
                .map(|(decoded, _)| decoded)
                .map_err(|e| anyhow!(e))?;
            Ok(Some(definition))
        } else {
            Ok(None)
        }
    }

    async fn delete_model(&self, namespace: &str, name: &str) -> Result<()> {
        let key = Self::model_key(namespace, name);
        self.models.remove(key).map_err(|e| anyhow!(e))?;

        // drop every provider record referencing the model
        let mut to_remove = Vec::new();
        for item in &self.providers {
            let (key, value) = item.map_err(|e| anyhow!(e))?;
            let record: StoredProvider =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map(|(decoded, _)| decoded)
                    .map_err(|e| anyhow!(e))?;
            if record.namespace == namespace && record.model == name {
                to_remove.push(key);
            }
        }
        for key in to_remove {
            self.providers.remove(key).map_err(|e| anyhow!(e))?;
        }

        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelDefinition>> {
        let mut definitions = Vec::new();
        for item in &self.models {
            let (_, value) = item.map_err(|e| anyhow!(e))?;
            let definition = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map(|(decoded, _)| decoded)
                .map_err(|e| anyhow!(e))?;
            definitions.push(definition);
        }
        Ok(definitions)
    }

    async fn save_provider(&self, provider: &StoredProvider) -> Result<()> {
        let model_key = Self::model_key(&provider.namespace, &provider.model);
        if self
            .models
            .get(model_key)
            .map_err(|e| anyhow!(e))?
            .is_none()
        {
            bail!(
                "provider {} references unsaved model {}/{}",
                provider.name,
                provider.namespace,
                provider.model
            );
        }

        let encoded = bincode::serde::encode_to_vec(provider, bincode::config::standard())
            .map_err(|e| anyhow!(e))?;
        self.providers
            .insert(provider.name.as_bytes(), encoded)
            .map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn delete_provider(&self, name: &str) -> Result<()> {
        self.providers
            .remove(name.as_bytes())
            .map_err(|e| anyhow!(e))?;
        self.db.flush_async().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<StoredProvider>> {
        let mut records = Vec::new();
        for item in &self.providers {
            let (_, value) = item.map_err(|e| anyhow!(e))?;
            let record = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .map(|(decoded, _)| decoded)
                .map_err(|e| anyhow!(e))?;
            records.push(record);
        }
        Ok(records)
    }
}
