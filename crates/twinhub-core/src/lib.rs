//! TwinHub Core Runtime
//!
//! This crate provides the digital-twin gateway core:
//! - Dynamic schema registry (models, services, resources) and the
//!   provider instance graph
//! - A single-threaded command gateway serializing every read and
//!   mutation of the twin
//! - One-shot futures per command and batched change notifications
//! - Cached resource access with WEAK/NORMAL/STRONG read levels
//! - Pluggable schema persistence (in-memory and sled backends)

pub mod command;
pub mod error;
pub mod gateway;
pub mod model;
pub mod nexus;
pub mod notification;
pub mod resource;
pub mod storage;
pub mod twin;
pub mod value;

pub use command::{Command, CommandFuture, CommandId};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayConfig};
pub use model::{
    ActionHandler, ExternalGetter, ModelDefinition, ResourceType, ADMIN_SERVICE, DEFAULT_NAMESPACE,
};
pub use nexus::SchemaRegistry;
pub use notification::{
    LifecycleKind, Notification, NotificationBatch, Notifier, ResourcePath,
};
pub use resource::{GetLevel, ResourceHandle};
pub use storage::{MemoryModelStore, ModelStore, SledModelStore, StoredProvider};
pub use twin::{DigitalTwin, ProviderSnapshot, ResourceSnapshot, ServiceSnapshot};
pub use value::{TimedValue, Value, ValueType};
