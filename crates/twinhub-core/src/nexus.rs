//! The live twin graph and its mutation façade
//!
//! [`Nexus`] owns the registered models and every provider instance built
//! from them. It is exclusively owned by the gateway thread's execution
//! context, which is what removes the need for locks on the graph.
//! Commands reach it through the command-scoped [`SchemaRegistry`] view;
//! nothing in here is shared across threads.

use crate::command::CommandScope;
use crate::error::{GatewayError, Result};
use crate::model::{
    ModelBuilder, ModelDefinition, ResourceSchema, ResourceType, ADMIN_SERVICE, DEFAULT_NAMESPACE,
};
use crate::notification::{LifecycleKind, ResourcePath};
use crate::resource::ResourceHandle;
use crate::storage::StoredProvider;
use crate::value::{TimedValue, Value};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One provider instance; its shape always equals its model's
pub(crate) struct Provider {
    pub(crate) model: Arc<ModelDefinition>,
    pub(crate) name: String,
    pub(crate) services: BTreeMap<String, ServiceInstance>,
}

pub(crate) struct ServiceInstance {
    pub(crate) resources: BTreeMap<String, ResourceInstance>,
}

pub(crate) struct ResourceInstance {
    pub(crate) current: TimedValue,
    /// Overrides only; schema defaults are merged at read time
    pub(crate) metadata: BTreeMap<String, Value>,
    pub(crate) last_external_fetch: Option<DateTime<Utc>>,
}

impl ResourceInstance {
    fn new() -> Self {
        Self {
            current: TimedValue::never(),
            metadata: BTreeMap::new(),
            last_external_fetch: None,
        }
    }
}

/// The model table plus the instance graph
pub(crate) struct Nexus {
    models: BTreeMap<(String, String), Arc<ModelDefinition>>,
    providers: BTreeMap<String, Provider>,
}

impl Nexus {
    pub(crate) fn new() -> Self {
        Self {
            models: BTreeMap::new(),
            providers: BTreeMap::new(),
        }
    }

    pub(crate) fn register_model(
        &mut self,
        definition: ModelDefinition,
    ) -> Result<Arc<ModelDefinition>> {
        let key = (definition.namespace.clone(), definition.name.clone());
        if self.models.contains_key(&key) {
            return Err(GatewayError::DuplicateModel {
                namespace: key.0,
                name: key.1,
            });
        }
        let definition = Arc::new(definition);
        self.models.insert(key, definition.clone());
        Ok(definition)
    }

    pub(crate) fn model(&self, namespace: &str, name: &str) -> Option<Arc<ModelDefinition>> {
        self.models
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// First model with this name, in namespace order
    pub(crate) fn model_by_name(&self, name: &str) -> Option<Arc<ModelDefinition>> {
        self.models
            .iter()
            .find(|((_, n), _)| n == name)
            .map(|(_, def)| def.clone())
    }

    pub(crate) fn remove_model(&mut self, namespace: &str, name: &str) {
        self.models
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Instantiate a provider with exactly its model's shape
    pub(crate) fn create_provider(
        &mut self,
        model: Arc<ModelDefinition>,
        name: &str,
    ) -> Result<()> {
        if self.providers.contains_key(name) {
            return Err(GatewayError::DuplicateProvider(name.to_string()));
        }
        let services = model
            .services
            .values()
            .map(|svc| {
                let resources = svc
                    .resources
                    .keys()
                    .map(|rc| (rc.clone(), ResourceInstance::new()))
                    .collect();
                (svc.name.clone(), ServiceInstance { resources })
            })
            .collect();
        self.providers.insert(
            name.to_string(),
            Provider {
                model,
                name: name.to_string(),
                services,
            },
        );
        Ok(())
    }

    pub(crate) fn remove_provider(&mut self, name: &str) -> Option<Provider> {
        self.providers.remove(name)
    }

    pub(crate) fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.get(name)
    }

    pub(crate) fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.values()
    }

    pub(crate) fn providers_of_model(&self, namespace: &str, name: &str) -> Vec<String> {
        self.providers
            .values()
            .filter(|p| p.model.namespace == namespace && p.model.name == name)
            .map(|p| p.name.clone())
            .collect()
    }

    fn unknown_resource(provider: &str, service: &str, resource: &str) -> GatewayError {
        GatewayError::UnknownResource {
            provider: provider.to_string(),
            service: service.to_string(),
            resource: resource.to_string(),
        }
    }

    fn instance(&self, provider: &str, service: &str, resource: &str) -> Result<&ResourceInstance> {
        let p = self
            .providers
            .get(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        p.services
            .get(service)
            .and_then(|s| s.resources.get(resource))
            .ok_or_else(|| Self::unknown_resource(provider, service, resource))
    }

    fn instance_mut(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Result<&mut ResourceInstance> {
        let p = self
            .providers
            .get_mut(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        p.services
            .get_mut(service)
            .and_then(|s| s.resources.get_mut(resource))
            .ok_or_else(|| Self::unknown_resource(provider, service, resource))
    }

    fn schema(&self, provider: &str, service: &str, resource: &str) -> Result<&ResourceSchema> {
        let p = self
            .providers
            .get(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        p.model
            .resource(service, resource)
            .ok_or_else(|| Self::unknown_resource(provider, service, resource))
    }

    pub(crate) fn resource_value(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Result<TimedValue> {
        Ok(self.instance(provider, service, resource)?.current.clone())
    }

    /// Store a new value, enforcing per-resource timestamp monotonicity.
    ///
    /// Returns the previous and the stored `TimedValue`.
    pub(crate) fn set_resource_value(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> Result<(TimedValue, TimedValue)> {
        {
            let schema = self.schema(provider, service, resource)?;
            if schema.resource_type == ResourceType::Action {
                return Err(GatewayError::NotReadable(resource.to_string()));
            }
            if !schema.value_type.accepts(&value) {
                return Err(GatewayError::TypeMismatch {
                    expected: schema.value_type,
                    actual: value.type_name(),
                });
            }
        }

        let instance = self.instance_mut(provider, service, resource)?;
        if let Some(stored) = instance.current.timestamp {
            if timestamp < stored {
                return Err(GatewayError::StaleWrite {
                    stored,
                    attempted: timestamp,
                });
            }
        }
        let old = instance.current.clone();
        let new = TimedValue::new(value, timestamp);
        instance.current = new.clone();
        Ok((old, new))
    }

    /// Schema defaults merged with instance overrides
    pub(crate) fn resource_metadata(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Result<BTreeMap<String, Value>> {
        let mut merged = self.schema(provider, service, resource)?.default_metadata.clone();
        for (k, v) in &self.instance(provider, service, resource)?.metadata {
            merged.insert(k.clone(), v.clone());
        }
        Ok(merged)
    }

    pub(crate) fn set_resource_metadata(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        key: String,
        value: Value,
    ) -> Result<()> {
        self.instance_mut(provider, service, resource)?
            .metadata
            .insert(key, value);
        Ok(())
    }

    pub(crate) fn last_external_fetch(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self.instance(provider, service, resource)?.last_external_fetch)
    }

    pub(crate) fn mark_external_fetch(
        &mut self,
        provider: &str,
        service: &str,
        resource: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.instance_mut(provider, service, resource)?
            .last_external_fetch = Some(at);
        Ok(())
    }
}

/// Sole authority for structural mutation, valid only inside the
/// originating command's execution window.
pub struct SchemaRegistry {
    scope: CommandScope,
}

impl SchemaRegistry {
    pub(crate) fn new(scope: CommandScope) -> Self {
        Self { scope }
    }

    /// Start building a model in the default namespace
    #[must_use]
    pub fn create_model(&self, name: impl Into<String>) -> ModelBuilder {
        ModelBuilder {
            scope: self.scope.clone(),
            def: ModelDefinition::new(DEFAULT_NAMESPACE, name),
        }
    }

    /// Identity lookup of a registered model
    pub fn get_model(&self, namespace: &str, name: &str) -> Result<Option<Arc<ModelDefinition>>> {
        self.scope.token().ensure_valid()?;
        Ok(self.scope.nexus().borrow().model(namespace, name))
    }

    /// Instantiate a provider from a registered model.
    ///
    /// Emits PROVIDER_APPEARING plus one SERVICE_APPEARING per service
    /// into the active accumulator, and initializes the admin service's
    /// `friendlyName` to the provider name.
    pub fn create_provider_instance(&self, model: &str, provider: &str) -> Result<()> {
        self.scope.token().ensure_valid()?;

        let definition = self
            .scope
            .nexus()
            .borrow()
            .model_by_name(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))?;

        self.scope
            .nexus()
            .borrow_mut()
            .create_provider(definition.clone(), provider)?;

        {
            let mut acc = self.scope.accumulator().borrow_mut();
            acc.add_lifecycle(
                LifecycleKind::ProviderAppearing,
                ResourcePath::provider(&definition.namespace, &definition.name, provider),
            )?;
            for service in definition.services.keys() {
                acc.add_lifecycle(
                    LifecycleKind::ServiceAppearing,
                    ResourcePath::service(&definition.namespace, &definition.name, provider, service),
                )?;
            }
        }

        let (old, new) = self.scope.nexus().borrow_mut().set_resource_value(
            provider,
            ADMIN_SERVICE,
            "friendlyName",
            Value::from(provider),
            Utc::now(),
        )?;
        self.scope.accumulator().borrow_mut().add_update(
            ResourcePath::resource(
                &definition.namespace,
                &definition.name,
                provider,
                ADMIN_SERVICE,
                "friendlyName",
            ),
            old,
            new,
        )?;

        self.scope.persist_provider(StoredProvider {
            namespace: definition.namespace.clone(),
            model: definition.name.clone(),
            name: provider.to_string(),
        });

        tracing::debug!(model = %definition.name, provider = %provider, "created provider");
        Ok(())
    }

    /// Lazy counterpart of [`SchemaRegistry::create_provider_instance`]:
    /// create the provider only if it is absent.
    ///
    /// Returns whether it was created. An existing provider built from a
    /// different model is a `DuplicateProvider` error.
    pub fn ensure_provider_instance(&self, model: &str, provider: &str) -> Result<bool> {
        self.scope.token().ensure_valid()?;

        let existing = self
            .scope
            .nexus()
            .borrow()
            .provider(provider)
            .map(|p| p.model.name.clone());
        match existing {
            Some(actual) if actual == model => Ok(false),
            Some(_) => Err(GatewayError::DuplicateProvider(provider.to_string())),
            None => {
                self.create_provider_instance(model, provider)?;
                Ok(true)
            }
        }
    }

    /// Remove a model and cascade over every provider built from it.
    ///
    /// DISAPPEARING events are emitted leaf first, before removal.
    /// Idempotent: deleting an absent model is a no-op.
    pub fn delete_model(&self, namespace: &str, name: &str) -> Result<()> {
        self.scope.token().ensure_valid()?;

        let Some(definition) = self.scope.nexus().borrow().model(namespace, name) else {
            return Ok(());
        };

        let providers = self
            .scope
            .nexus()
            .borrow()
            .providers_of_model(namespace, name);
        for provider in providers {
            self.remove_provider_cascading(&definition, &provider)?;
        }

        self.scope.nexus().borrow_mut().remove_model(namespace, name);
        self.scope
            .remove_persisted_model(namespace.to_string(), name.to_string());
        tracing::debug!(namespace = %namespace, model = %name, "deleted model");
        Ok(())
    }

    /// Remove a single provider, leaf first. Idempotent.
    pub fn delete_provider(&self, name: &str) -> Result<()> {
        self.scope.token().ensure_valid()?;

        let Some(definition) = self
            .scope
            .nexus()
            .borrow()
            .provider(name)
            .map(|p| p.model.clone())
        else {
            return Ok(());
        };
        self.remove_provider_cascading(&definition, name)
    }

    fn remove_provider_cascading(
        &self,
        definition: &Arc<ModelDefinition>,
        provider: &str,
    ) -> Result<()> {
        {
            let mut acc = self.scope.accumulator().borrow_mut();
            for (service, schema) in &definition.services {
                for resource in schema.resources.keys() {
                    acc.add_lifecycle(
                        LifecycleKind::ResourceDisappearing,
                        ResourcePath::resource(
                            &definition.namespace,
                            &definition.name,
                            provider,
                            service,
                            resource,
                        ),
                    )?;
                }
                acc.add_lifecycle(
                    LifecycleKind::ServiceDisappearing,
                    ResourcePath::service(&definition.namespace, &definition.name, provider, service),
                )?;
            }
            acc.add_lifecycle(
                LifecycleKind::ProviderDisappearing,
                ResourcePath::provider(&definition.namespace, &definition.name, provider),
            )?;
        }

        self.scope.nexus().borrow_mut().remove_provider(provider);
        self.scope.remove_persisted_provider(provider.to_string());
        tracing::debug!(provider = %provider, "deleted provider");
        Ok(())
    }

    /// Resolve a bounded-lifetime handle for one resource instance.
    ///
    /// Returns `None` when the path does not exist; a supplied model name
    /// must match the provider's actual model or the lookup fails.
    pub fn resolve_resource(
        &self,
        provider: &str,
        service: &str,
        resource: &str,
        model: Option<&str>,
    ) -> Result<Option<ResourceHandle>> {
        self.scope.token().ensure_valid()?;

        let nexus = self.scope.nexus().borrow();
        let Some(p) = nexus.provider(provider) else {
            return Ok(None);
        };
        if let Some(expected) = model {
            if p.model.name != expected {
                return Ok(None);
            }
        }
        let Some(schema) = p.model.resource(service, resource) else {
            return Ok(None);
        };
        let path = ResourcePath::resource(
            &p.model.namespace,
            &p.model.name,
            provider,
            service,
            resource,
        );
        Ok(Some(ResourceHandle::new(
            self.scope.clone(),
            path,
            schema.clone(),
        )))
    }
}
