//! Persistent schema storage
//!
//! A pluggable typed store for model definitions and provider records
//! with reference integrity: a provider record can only be saved while
//! its model is stored, and deleting a model removes its provider
//! records. Runtime-only hooks (external getters, action handlers) are
//! never persisted.

pub mod memory_store;
pub mod sled_store;

pub use memory_store::MemoryModelStore;
pub use sled_store::SledModelStore;

use crate::model::ModelDefinition;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Persisted provider record referencing its model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredProvider {
    pub namespace: String,
    pub model: String,
    pub name: String,
}

/// Store trait for different schema-persistence backends
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Save or replace a model definition
    async fn save_model(&self, definition: &ModelDefinition) -> Result<()>;

    /// Load one model definition
    async fn load_model(&self, namespace: &str, name: &str) -> Result<Option<ModelDefinition>>;

    /// Delete a model and every provider record referencing it
    async fn delete_model(&self, namespace: &str, name: &str) -> Result<()>;

    /// All stored model definitions
    async fn list_models(&self) -> Result<Vec<ModelDefinition>>;

    /// Save a provider record; fails unless its model is stored
    async fn save_provider(&self, provider: &StoredProvider) -> Result<()>;

    /// Delete one provider record
    async fn delete_provider(&self, name: &str) -> Result<()>;

    /// All stored provider records
    async fn list_providers(&self) -> Result<Vec<StoredProvider>>;
}
