//! Read-only, filterable façade over the instance graph
//!
//! Snapshots are immutable deep copies taken at a single point in time;
//! they share no state with the live graph and may freely leave the
//! gateway thread.

use crate::command::CommandScope;
use crate::error::{GatewayError, Result};
use crate::model::ResourceType;
use crate::nexus::Provider;
use crate::value::{TimedValue, Value, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of one resource instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub name: String,
    pub resource_type: ResourceType,
    pub value_type: ValueType,
    pub value: TimedValue,
    pub metadata: BTreeMap<String, Value>,
}

/// Point-in-time copy of one service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub resources: Vec<ResourceSnapshot>,
}

impl ServiceSnapshot {
    pub fn resource(&self, name: &str) -> Option<&ResourceSnapshot> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// Point-in-time copy of one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub namespace: String,
    pub model: String,
    pub name: String,
    pub services: Vec<ServiceSnapshot>,
    pub snapshot_time: DateTime<Utc>,
}

impl ProviderSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceSnapshot> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn resource(&self, service: &str, resource: &str) -> Option<&ResourceSnapshot> {
        self.service(service).and_then(|s| s.resource(resource))
    }

    /// Convenience for cross-resource predicates
    pub fn resource_value(&self, service: &str, resource: &str) -> Option<&TimedValue> {
        self.resource(service, resource).map(|r| &r.value)
    }

    /// All resources, paired with their service name
    pub fn resources(&self) -> impl Iterator<Item = (&str, &ResourceSnapshot)> {
        self.services
            .iter()
            .flat_map(|s| s.resources.iter().map(move |r| (s.name.as_str(), r)))
    }
}

/// Filter over (namespace, model name)
pub type ModelFilter<'a> = &'a dyn Fn(&str, &str) -> bool;
/// Filter over a provider snapshot
pub type ProviderFilter<'a> = &'a dyn Fn(&ProviderSnapshot) -> bool;
/// Filter over a single service snapshot; non-matching services are pruned
pub type ServiceFilter<'a> = &'a dyn Fn(&ServiceSnapshot) -> bool;
/// Final predicate over a surviving provider with its surviving resources
pub type ResourceFilter<'a> = &'a dyn Fn(&ProviderSnapshot) -> bool;

/// Read-only view over the twin, valid only inside the originating
/// command's execution window.
pub struct DigitalTwin {
    scope: CommandScope,
}

impl DigitalTwin {
    pub(crate) fn new(scope: CommandScope) -> Self {
        Self { scope }
    }

    /// Snapshot the twin, applying filters successively:
    /// model → provider → service → resource-value. A `None` filter
    /// accepts everything at that stage.
    pub fn filtered_snapshot(
        &self,
        model: Option<ModelFilter<'_>>,
        provider: Option<ProviderFilter<'_>>,
        service: Option<ServiceFilter<'_>>,
        resources: Option<ResourceFilter<'_>>,
    ) -> Result<Vec<ProviderSnapshot>> {
        self.scope.token().ensure_valid()?;
        let snapshot_time = Utc::now();

        let mut snapshots: Vec<ProviderSnapshot> = {
            let nexus = self.scope.nexus().borrow();
            nexus
                .providers()
                .filter(|p| match model {
                    Some(f) => f(&p.model.namespace, &p.model.name),
                    None => true,
                })
                .map(|p| Self::snapshot_of(p, snapshot_time))
                .collect()
        };

        if let Some(f) = provider {
            snapshots.retain(|p| f(p));
        }

        if let Some(f) = service {
            snapshots = snapshots
                .into_iter()
                .filter_map(|mut p| {
                    p.services.retain(|s| f(s));
                    if p.services.is_empty() {
                        None
                    } else {
                        Some(p)
                    }
                })
                .collect();
        }

        if let Some(f) = resources {
            snapshots.retain(|p| f(p));
        }

        Ok(snapshots)
    }

    /// Unfiltered snapshot of every live provider
    pub fn snapshot(&self) -> Result<Vec<ProviderSnapshot>> {
        self.filtered_snapshot(None, None, None, None)
    }

    /// Snapshot one provider by name
    pub fn snapshot_provider(&self, name: &str) -> Result<Option<ProviderSnapshot>> {
        self.scope.token().ensure_valid()?;
        let nexus = self.scope.nexus().borrow();
        Ok(nexus
            .provider(name)
            .map(|p| Self::snapshot_of(p, Utc::now())))
    }

    /// Names of every live provider
    pub fn get_providers(&self) -> Result<Vec<String>> {
        self.scope.token().ensure_valid()?;
        Ok(self
            .scope
            .nexus()
            .borrow()
            .providers()
            .map(|p| p.name.clone())
            .collect())
    }

    /// Service names of one provider
    pub fn get_services(&self, provider: &str) -> Result<Vec<String>> {
        self.scope.token().ensure_valid()?;
        let nexus = self.scope.nexus().borrow();
        let p = nexus
            .provider(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        Ok(p.model.services.keys().cloned().collect())
    }

    /// Resource names of one service
    pub fn get_resources(&self, provider: &str, service: &str) -> Result<Vec<String>> {
        self.scope.token().ensure_valid()?;
        let nexus = self.scope.nexus().borrow();
        let p = nexus
            .provider(provider)
            .ok_or_else(|| GatewayError::UnknownProvider(provider.to_string()))?;
        let svc = p
            .model
            .service(service)
            .ok_or_else(|| GatewayError::UnknownService {
                provider: provider.to_string(),
                service: service.to_string(),
            })?;
        Ok(svc.resources.keys().cloned().collect())
    }

    /// Deep copy of one live provider
    fn snapshot_of(provider: &Provider, snapshot_time: DateTime<Utc>) -> ProviderSnapshot {
        let services = provider
            .model
            .services
            .values()
            .map(|svc_schema| {
                let live = provider.services.get(&svc_schema.name);
                let resources = svc_schema
                    .resources
                    .values()
                    .map(|rc_schema| {
                        let instance = live.and_then(|s| s.resources.get(&rc_schema.name));
                        let mut metadata = rc_schema.default_metadata.clone();
                        let value = match instance {
                            Some(inst) => {
                                for (k, v) in &inst.metadata {
                                    metadata.insert(k.clone(), v.clone());
                                }
                                inst.current.clone()
                            }
                            None => TimedValue::never(),
                        };
                        ResourceSnapshot {
                            name: rc_schema.name.clone(),
                            resource_type: rc_schema.resource_type,
                            value_type: rc_schema.value_type,
                            value,
                            metadata,
                        }
                    })
                    .collect();
                ServiceSnapshot {
                    name: svc_schema.name.clone(),
                    resources,
                }
            })
            .collect();

        ProviderSnapshot {
            namespace: provider.model.namespace.clone(),
            model: provider.model.name.clone(),
            name: provider.name.clone(),
            services,
            snapshot_time,
        }
    }
}
