//! Bounded-lifetime access to one resource instance
//!
//! A [`ResourceHandle`] is resolved inside a command and is only usable
//! there: every accessor revalidates the scope lease, and the handle is
//! `!Send` so it cannot leave the gateway thread. Reads go through the
//! [`GetLevel`] cache policy; writes enforce timestamp monotonicity;
//! actions are dispatched to their handler without blocking the gateway.

use crate::command::{CommandFuture, CommandScope};
use crate::error::{GatewayError, Result};
use crate::model::{ExternalGetter, ResourceSchema, ResourceType};
use crate::notification::{Notification, NotificationBatch, ResourcePath};
use crate::value::{TimedValue, Value, ValueType};
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

/// Read policy controlling external-getter invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GetLevel {
    /// Use the cached value while it is fresh, pull otherwise
    #[default]
    Normal,
    /// Always the cached value, even stale or never set
    Weak,
    /// Always pull, ignoring freshness
    Strong,
}

/// Accessor for one resource instance, valid only inside the command
/// that resolved it.
pub struct ResourceHandle {
    scope: CommandScope,
    path: ResourcePath,
    schema: ResourceSchema,
}

impl ResourceHandle {
    pub(crate) fn new(scope: CommandScope, path: ResourcePath, schema: ResourceSchema) -> Self {
        Self {
            scope,
            path,
            schema,
        }
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.schema.resource_type
    }

    pub fn value_type(&self) -> ValueType {
        self.schema.value_type
    }

    /// Declared argument list of an ACTION resource
    pub fn arguments(&self) -> Result<&[(String, ValueType)]> {
        if self.schema.resource_type != ResourceType::Action {
            return Err(GatewayError::NotAnAction(self.schema.name.clone()));
        }
        Ok(&self.schema.arguments)
    }

    /// True only during the originating command's execution window
    pub fn is_valid(&self) -> bool {
        self.scope.token().is_valid()
    }

    // Handles always carry a full path
    fn service(&self) -> &str {
        self.path.service.as_deref().unwrap_or_default()
    }

    fn resource(&self) -> &str {
        self.path.resource.as_deref().unwrap_or_default()
    }

    /// Read the resource under the given cache policy.
    ///
    /// Without an external getter all levels return the cached value.
    pub fn get(&self, level: GetLevel) -> Result<TimedValue> {
        self.scope.token().ensure_valid()?;
        if self.schema.resource_type == ResourceType::Action {
            return Err(GatewayError::NotReadable(self.schema.name.clone()));
        }

        let cached = self.scope.nexus().borrow().resource_value(
            &self.path.provider,
            self.service(),
            self.resource(),
        )?;

        let Some(getter) = self.schema.external_getter.clone() else {
            return Ok(cached);
        };

        match level {
            GetLevel::Weak => Ok(cached),
            GetLevel::Strong => self.pull_and_store(getter.as_ref(), cached),
            GetLevel::Normal => {
                if self.is_fresh(&cached) {
                    Ok(cached)
                } else {
                    self.pull_and_store(getter.as_ref(), cached)
                }
            }
        }
    }

    fn is_fresh(&self, cached: &TimedValue) -> bool {
        let Some(ts) = cached.timestamp else {
            return false;
        };
        let period = self
            .schema
            .cache_period()
            .unwrap_or_else(|| self.scope.default_cache_period());
        match (Utc::now() - ts).to_std() {
            Ok(age) => age <= period,
            // a future-stamped value cannot be stale
            Err(_) => true,
        }
    }

    fn pull_and_store(&self, getter: &dyn ExternalGetter, cached: TimedValue) -> Result<TimedValue> {
        let fetched = match getter.fetch(&self.path) {
            Ok(fetched) => fetched,
            Err(e) => {
                self.scope
                    .accumulator()
                    .borrow_mut()
                    .add_error(self.path.clone(), e.to_string())?;
                return Err(GatewayError::External(e));
            }
        };

        // a getter may decline to produce a value; the cache stands
        let (Some(value), timestamp) = (fetched.value, fetched.timestamp) else {
            return Ok(cached);
        };
        let timestamp = timestamp.unwrap_or_else(Utc::now);

        let (old, new) = self.scope.nexus().borrow_mut().set_resource_value(
            &self.path.provider,
            self.service(),
            self.resource(),
            value,
            timestamp,
        )?;
        self.scope.nexus().borrow_mut().mark_external_fetch(
            &self.path.provider,
            self.service(),
            self.resource(),
            Utc::now(),
        )?;
        self.scope
            .accumulator()
            .borrow_mut()
            .add_update(self.path.clone(), old, new.clone())?;
        Ok(new)
    }

    /// Store a new value stamped with the current time
    pub fn set(&self, value: Value) -> Result<()> {
        self.set_with_timestamp(value, Utc::now())
    }

    /// Store a new value with an explicit timestamp.
    ///
    /// A timestamp older than the stored one fails with `StaleWrite` and
    /// changes nothing.
    pub fn set_with_timestamp(
        &self,
        value: Value,
        timestamp: chrono::DateTime<Utc>,
    ) -> Result<()> {
        self.scope.token().ensure_valid()?;
        let (old, new) = self.scope.nexus().borrow_mut().set_resource_value(
            &self.path.provider,
            self.service(),
            self.resource(),
            value,
            timestamp,
        )?;
        self.scope
            .accumulator()
            .borrow_mut()
            .add_update(self.path.clone(), old, new)?;
        Ok(())
    }

    /// Invoke an ACTION resource.
    ///
    /// Arguments are validated against the schema's ordered list, then the
    /// call is handed to the registered handler. The returned future may
    /// resolve after the originating command's gateway slot has completed;
    /// completion is also published to subscribers as an ACTION_RESULT
    /// batch of its own.
    pub fn act(&self, arguments: Vec<Value>) -> Result<CommandFuture<Value>> {
        self.scope.token().ensure_valid()?;
        if self.schema.resource_type != ResourceType::Action {
            return Err(GatewayError::NotAnAction(self.schema.name.clone()));
        }
        let handler = self
            .schema
            .action_handler
            .clone()
            .ok_or_else(|| GatewayError::NoActionHandler(self.schema.name.clone()))?;

        if arguments.len() != self.schema.arguments.len() {
            return Err(GatewayError::InvalidArguments(format!(
                "{} expects {} arguments, got {}",
                self.schema.name,
                self.schema.arguments.len(),
                arguments.len()
            )));
        }
        for ((name, expected), value) in self.schema.arguments.iter().zip(&arguments) {
            if !expected.accepts(value) {
                return Err(GatewayError::InvalidArguments(format!(
                    "argument {name} expects {expected}, got {}",
                    value.type_name()
                )));
            }
        }

        let pending = handler.act(&self.path, arguments);
        let (sender, receiver) = oneshot::channel();
        let notifier = self.scope.notifier().clone();
        let command = self.scope.accumulator().borrow().command();
        let path = self.path.clone();

        self.scope.worker().spawn(async move {
            let outcome = pending.await;
            let result = match &outcome {
                Ok(value) => Ok(value.clone()),
                Err(e) => Err(e.to_string()),
            };
            notifier.publish(NotificationBatch {
                command,
                events: vec![Notification::ActionResult {
                    path,
                    result,
                    timestamp: Utc::now(),
                }],
            });
            let _ = sender.send(outcome.map_err(GatewayError::External));
        });

        Ok(CommandFuture::new(receiver))
    }

    /// Metadata for this resource: schema defaults merged with overrides
    pub fn metadata_values(&self) -> Result<BTreeMap<String, Value>> {
        self.scope.token().ensure_valid()?;
        self.scope.nexus().borrow().resource_metadata(
            &self.path.provider,
            self.service(),
            self.resource(),
        )
    }

    pub fn metadata_value(&self, name: &str) -> Result<Option<Value>> {
        Ok(self.metadata_values()?.remove(name))
    }

    /// Override one metadata entry on this instance
    pub fn set_metadata_value(&self, name: impl Into<String>, value: Value) -> Result<()> {
        self.scope.token().ensure_valid()?;
        self.scope.nexus().borrow_mut().set_resource_metadata(
            &self.path.provider,
            self.service(),
            self.resource(),
            name.into(),
            value,
        )
    }

    /// When the external getter last stored a value, if ever
    pub fn last_external_fetch(&self) -> Result<Option<chrono::DateTime<Utc>>> {
        self.scope.token().ensure_valid()?;
        self.scope.nexus().borrow().last_external_fetch(
            &self.path.provider,
            self.service(),
            self.resource(),
        )
    }
}
