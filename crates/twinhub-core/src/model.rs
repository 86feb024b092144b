//! Schema side of the twin: models, services, resources
//!
//! A model describes the full shape of a provider kind. Providers are
//! instantiated from a model and always carry exactly its services and
//! resources, plus the implicit `admin` service every model receives.
//!
//! Definitions are plain serde data so they can be persisted through a
//! [`ModelStore`](crate::storage::ModelStore); the external getter and
//! action handler hooks are runtime-only and never serialized.

use crate::command::CommandScope;
use crate::error::Result;
use crate::notification::ResourcePath;
use crate::value::{TimedValue, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// The implicit service every model carries
pub const ADMIN_SERVICE: &str = "admin";

/// Namespace used when a model builder does not set one
pub const DEFAULT_NAMESPACE: &str = "default";

/// How a resource behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ResourceType {
    /// A measured value pushed or pulled from the outside world
    #[default]
    Sensor,
    /// An invocable operation; carries no readable value
    Action,
    /// A value reflecting device state
    State,
    /// A configuration property
    Property,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Sensor => "SENSOR",
            ResourceType::Action => "ACTION",
            ResourceType::State => "STATE",
            ResourceType::Property => "PROPERTY",
        };
        write!(f, "{name}")
    }
}

/// Future returned by an [`ActionHandler`]
pub type ActionFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// Per-resource callback invoked by GET at levels NORMAL and STRONG.
///
/// Returns the fresh value with its acquisition timestamp, or fails; a
/// failure leaves the twin untouched.
pub trait ExternalGetter: Send + Sync {
    fn fetch(&self, path: &ResourcePath) -> anyhow::Result<TimedValue>;
}

impl<F> ExternalGetter for F
where
    F: Fn(&ResourcePath) -> anyhow::Result<TimedValue> + Send + Sync,
{
    fn fetch(&self, path: &ResourcePath) -> anyhow::Result<TimedValue> {
        self(path)
    }
}

/// Handler backing an ACTION resource.
///
/// Invoked on ACT access with already-validated arguments; may fail
/// asynchronously. The gateway never blocks on the returned future.
pub trait ActionHandler: Send + Sync {
    fn act(&self, path: &ResourcePath, arguments: Vec<Value>) -> ActionFuture;
}

impl<F> ActionHandler for F
where
    F: Fn(&ResourcePath, Vec<Value>) -> ActionFuture + Send + Sync,
{
    fn act(&self, path: &ResourcePath, arguments: Vec<Value>) -> ActionFuture {
        self(path, arguments)
    }
}

/// Declared shape of one resource
#[derive(Clone, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: String,
    pub value_type: ValueType,
    pub resource_type: ResourceType,
    /// Ordered argument list; only meaningful for ACTION resources
    pub arguments: Vec<(String, ValueType)>,
    /// Metadata every instance of this resource starts with
    pub default_metadata: BTreeMap<String, Value>,
    /// Freshness window for GET at level NORMAL; falls back to the
    /// gateway-wide default when unset
    pub cache_period_ms: Option<u64>,
    #[serde(skip)]
    pub external_getter: Option<Arc<dyn ExternalGetter>>,
    #[serde(skip)]
    pub action_handler: Option<Arc<dyn ActionHandler>>,
}

impl ResourceSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::default(),
            resource_type: ResourceType::default(),
            arguments: Vec::new(),
            default_metadata: BTreeMap::new(),
            cache_period_ms: None,
            external_getter: None,
            action_handler: None,
        }
    }

    /// Effective cache period, if one was declared on the schema
    pub fn cache_period(&self) -> Option<Duration> {
        self.cache_period_ms.map(Duration::from_millis)
    }
}

impl fmt::Debug for ResourceSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSchema")
            .field("name", &self.name)
            .field("value_type", &self.value_type)
            .field("resource_type", &self.resource_type)
            .field("arguments", &self.arguments)
            .field("default_metadata", &self.default_metadata)
            .field("cache_period_ms", &self.cache_period_ms)
            .field("external_getter", &self.external_getter.is_some())
            .field("action_handler", &self.action_handler.is_some())
            .finish()
    }
}

/// Named group of resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSchema {
    pub name: String,
    pub resources: BTreeMap<String, ResourceSchema>,
}

impl ServiceSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeMap::new(),
        }
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSchema> {
        self.resources.get(name)
    }
}

/// Full shape of a provider kind.
///
/// Immutable once registered; evolution happens through registry
/// operations only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub namespace: String,
    pub name: String,
    pub services: BTreeMap<String, ServiceSchema>,
}

impl ModelDefinition {
    /// Create a definition with the implicit `admin` service
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let mut services = BTreeMap::new();
        services.insert(ADMIN_SERVICE.to_string(), Self::admin_service());
        Self {
            namespace: namespace.into(),
            name: name.into(),
            services,
        }
    }

    /// The implicit admin service: friendlyName, location, description, icon
    fn admin_service() -> ServiceSchema {
        let mut svc = ServiceSchema::new(ADMIN_SERVICE);
        for name in ["friendlyName", "location", "description", "icon"] {
            let mut rc = ResourceSchema::new(name);
            rc.value_type = ValueType::String;
            rc.resource_type = ResourceType::Property;
            svc.resources.insert(name.to_string(), rc);
        }
        svc
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSchema> {
        self.services.get(name)
    }

    pub fn resource(&self, service: &str, resource: &str) -> Option<&ResourceSchema> {
        self.services.get(service).and_then(|s| s.resource(resource))
    }
}

/// Builder for a new model, obtained from
/// [`SchemaRegistry::create_model`](crate::nexus::SchemaRegistry::create_model).
///
/// Builders nest: `create_model("m").service("s").resource("r")` descends,
/// each `build()` ascends, and the final [`ModelBuilder::build`] registers
/// the model.
pub struct ModelBuilder {
    pub(crate) scope: CommandScope,
    pub(crate) def: ModelDefinition,
}

impl ModelBuilder {
    /// Override the default namespace
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.def.namespace = namespace.into();
        self
    }

    /// Start describing a service of this model
    #[must_use]
    pub fn service(self, name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            schema: ServiceSchema::new(name),
            parent: self,
        }
    }

    /// Register the model.
    ///
    /// Fails with [`crate::error::GatewayError::DuplicateModel`] if the
    /// namespace/name pair is already registered.
    pub fn build(self) -> Result<Arc<ModelDefinition>> {
        let Self { scope, def } = self;
        scope.token().ensure_valid()?;
        let registered = scope.nexus().borrow_mut().register_model(def)?;
        tracing::debug!(
            namespace = %registered.namespace,
            model = %registered.name,
            "registered model"
        );
        scope.persist_model(&registered);
        Ok(registered)
    }
}

/// Builder for one service of a model under construction
pub struct ServiceBuilder {
    parent: ModelBuilder,
    schema: ServiceSchema,
}

impl ServiceBuilder {
    /// Start describing a resource of this service
    #[must_use]
    pub fn resource(self, name: impl Into<String>) -> ResourceBuilder {
        ResourceBuilder {
            schema: ResourceSchema::new(name),
            parent: self,
        }
    }

    /// Finish this service and return to the model builder
    #[must_use]
    pub fn build(mut self) -> ModelBuilder {
        self.parent
            .def
            .services
            .insert(self.schema.name.clone(), self.schema);
        self.parent
    }
}

/// Builder for one resource of a service under construction
pub struct ResourceBuilder {
    parent: ServiceBuilder,
    schema: ResourceSchema,
}

impl ResourceBuilder {
    #[must_use]
    pub fn value_type(mut self, value_type: ValueType) -> Self {
        self.schema.value_type = value_type;
        self
    }

    #[must_use]
    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        self.schema.resource_type = resource_type;
        self
    }

    /// Declare the ordered argument list; forces the resource to ACTION
    #[must_use]
    pub fn action_arguments(mut self, arguments: Vec<(String, ValueType)>) -> Self {
        self.schema.arguments = arguments;
        self.schema.resource_type = ResourceType::Action;
        self
    }

    /// Add one default metadata entry
    #[must_use]
    pub fn default_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.schema.default_metadata.insert(key.into(), value);
        self
    }

    /// Freshness window for GET at level NORMAL on this resource
    #[must_use]
    pub fn cache_period(mut self, period: Duration) -> Self {
        self.schema.cache_period_ms = Some(period.as_millis() as u64);
        self
    }

    #[must_use]
    pub fn external_getter(mut self, getter: impl ExternalGetter + 'static) -> Self {
        self.schema.external_getter = Some(Arc::new(getter));
        self
    }

    /// Register the action handler; forces the resource to ACTION
    #[must_use]
    pub fn action_handler(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.schema.action_handler = Some(Arc::new(handler));
        self.schema.resource_type = ResourceType::Action;
        self
    }

    /// Finish this resource and return to the service builder
    #[must_use]
    pub fn build(mut self) -> ServiceBuilder {
        self.parent
            .schema
            .resources
            .insert(self.schema.name.clone(), self.schema);
        self.parent
    }
}
