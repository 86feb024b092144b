//! Batched change notifications
//!
//! Every command runs with a fresh [`NotificationAccumulator`]. Events are
//! buffered, collapsed per target, and flushed as a single
//! [`NotificationBatch`] once the command completes — only the
//! post-command state is externally observable. Delivery uses a tokio
//! broadcast channel; publishing succeeds even with no subscribers.

use crate::command::CommandId;
use crate::error::{GatewayError, Result};
use crate::value::{TimedValue, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;

/// Addresses one node of the twin graph.
///
/// `service`/`resource` are `None` for provider-level events.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub namespace: String,
    pub model: String,
    pub provider: String,
    pub service: Option<String>,
    pub resource: Option<String>,
}

impl ResourcePath {
    pub fn provider(
        namespace: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            model: model.into(),
            provider: provider.into(),
            service: None,
            resource: None,
        }
    }

    pub fn service(
        namespace: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            service: Some(service.into()),
            ..Self::provider(namespace, model, provider)
        }
    }

    pub fn resource(
        namespace: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        service: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Self::service(namespace, model, provider, service)
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.model, self.provider)?;
        if let Some(svc) = &self.service {
            write!(f, "/{svc}")?;
        }
        if let Some(rc) = &self.resource {
            write!(f, "/{rc}")?;
        }
        Ok(())
    }
}

/// Structural lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleKind {
    ProviderAppearing,
    ProviderDisappearing,
    ServiceAppearing,
    ServiceDisappearing,
    ResourceAppearing,
    ResourceDisappearing,
}

impl LifecycleKind {
    pub fn is_disappearing(self) -> bool {
        matches!(
            self,
            LifecycleKind::ProviderDisappearing
                | LifecycleKind::ServiceDisappearing
                | LifecycleKind::ResourceDisappearing
        )
    }
}

/// One observable change to the twin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    /// A node appeared or disappeared
    Lifecycle {
        kind: LifecycleKind,
        path: ResourcePath,
        timestamp: DateTime<Utc>,
    },

    /// A resource value changed
    Update {
        path: ResourcePath,
        old: TimedValue,
        new: TimedValue,
        timestamp: DateTime<Utc>,
    },

    /// An ACTION completed, successfully or not
    ActionResult {
        path: ResourcePath,
        result: std::result::Result<Value, String>,
        timestamp: DateTime<Utc>,
    },

    /// An external call failed against this path
    Error {
        path: ResourcePath,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl Notification {
    pub fn path(&self) -> &ResourcePath {
        match self {
            Self::Lifecycle { path, .. }
            | Self::Update { path, .. }
            | Self::ActionResult { path, .. }
            | Self::Error { path, .. } => path,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Lifecycle { timestamp, .. }
            | Self::Update { timestamp, .. }
            | Self::ActionResult { timestamp, .. }
            | Self::Error { timestamp, .. } => *timestamp,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lifecycle {
                kind,
                path,
                timestamp,
            } => write!(f, "[{timestamp}] {path} {kind:?}"),
            Self::Update {
                path,
                old,
                new,
                timestamp,
            } => write!(f, "[{timestamp}] {path} {old} -> {new}"),
            Self::ActionResult {
                path,
                result,
                timestamp,
            } => match result {
                Ok(v) => write!(f, "[{timestamp}] {path} acted: {v}"),
                Err(e) => write!(f, "[{timestamp}] {path} action failed: {e}"),
            },
            Self::Error {
                path,
                message,
                timestamp,
            } => write!(f, "[{timestamp}] {path} error: {message}"),
        }
    }
}

/// The ordered batch flushed after one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBatch {
    /// The command this batch was accumulated for
    pub command: CommandId,
    pub events: Vec<Notification>,
}

impl NotificationBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Buffer families; the order fixes flush order within one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    Lifecycle,
    Update,
    Error,
}

/// Sort key: path order first, lifecycle before data within one path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct NotificationKey {
    provider: String,
    service: Option<String>,
    resource: Option<String>,
    family: Family,
}

impl NotificationKey {
    fn new(path: &ResourcePath, family: Family) -> Self {
        Self {
            provider: path.provider.clone(),
            service: path.service.clone(),
            resource: path.resource.clone(),
            family,
        }
    }
}

/// Per-command buffer of lifecycle/update/error events.
///
/// Multiple events for the same target collapse so subscribers only see
/// the post-command state. Not thread safe; written only by the executing
/// command and drained only by the gateway thread.
pub struct NotificationAccumulator {
    command: CommandId,
    buffer: BTreeMap<NotificationKey, Vec<Notification>>,
    completed: bool,
}

impl NotificationAccumulator {
    pub fn new(command: CommandId) -> Self {
        Self {
            command,
            buffer: BTreeMap::new(),
            completed: false,
        }
    }

    pub fn command(&self) -> CommandId {
        self.command
    }

    fn check_open(&self) -> Result<()> {
        if self.completed {
            return Err(GatewayError::ConcurrencyMisuse);
        }
        Ok(())
    }

    /// Record a lifecycle transition.
    ///
    /// Collapse rules per target: a repeated status replaces the previous
    /// one; CREATE then DELETE cancel out entirely; DELETE then CREATE are
    /// both kept in order; DELETE, CREATE, DELETE collapse to one DELETE.
    pub fn add_lifecycle(&mut self, kind: LifecycleKind, path: ResourcePath) -> Result<()> {
        self.check_open()?;
        let key = NotificationKey::new(&path, Family::Lifecycle);
        let event = Notification::Lifecycle {
            kind,
            path,
            timestamp: Utc::now(),
        };

        let mut cancel_out = false;
        if let Some(events) = self.buffer.get_mut(&key) {
            let last_kind = match events.last() {
                Some(Notification::Lifecycle { kind, .. }) => *kind,
                _ => unreachable!("lifecycle family holds lifecycle events"),
            };
            if last_kind == kind {
                // repeated status: the newer event replaces the last one
                if let Some(last) = events.last_mut() {
                    *last = event;
                }
            } else if kind.is_disappearing() {
                if events.len() == 1 {
                    // created then deleted inside one command: nothing was
                    // ever externally observable
                    cancel_out = true;
                } else {
                    *events = vec![event];
                }
            } else {
                // delete then (re)create
                events.push(event);
            }
        } else {
            self.buffer.insert(key, vec![event]);
            return Ok(());
        }
        if cancel_out {
            self.buffer.remove(&key);
        }
        Ok(())
    }

    /// Record a value update.
    ///
    /// Repeated updates to one resource collapse into a single event
    /// keeping the first old value and the latest new value/timestamp.
    pub fn add_update(&mut self, path: ResourcePath, old: TimedValue, new: TimedValue) -> Result<()> {
        self.check_open()?;
        let timestamp = new.timestamp.unwrap_or_else(Utc::now);
        let key = NotificationKey::new(&path, Family::Update);

        match self.buffer.get_mut(&key) {
            None => {
                self.buffer.insert(
                    key,
                    vec![Notification::Update {
                        path,
                        old,
                        new,
                        timestamp,
                    }],
                );
            }
            Some(events) => {
                let (first_old, buffered_ts) = match events.first() {
                    Some(Notification::Update {
                        old, timestamp, ..
                    }) => (old.clone(), *timestamp),
                    _ => unreachable!("update family holds update events"),
                };
                if buffered_ts > timestamp {
                    return Err(GatewayError::StaleWrite {
                        stored: buffered_ts,
                        attempted: timestamp,
                    });
                }
                *events = vec![Notification::Update {
                    path,
                    old: first_old,
                    new,
                    timestamp,
                }];
            }
        }
        Ok(())
    }

    /// Record an external failure against a path; errors never collapse
    pub fn add_error(&mut self, path: ResourcePath, message: impl Into<String>) -> Result<()> {
        self.check_open()?;
        let key = NotificationKey::new(&path, Family::Error);
        self.buffer.entry(key).or_default().push(Notification::Error {
            path,
            message: message.into(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Drain the buffer into its flush-ordered batch.
    ///
    /// Runs exactly once, after the command completed; an empty buffer
    /// still yields an (empty) batch.
    pub fn flush(&mut self) -> Result<NotificationBatch> {
        self.check_open()?;
        self.completed = true;
        let events = std::mem::take(&mut self.buffer)
            .into_values()
            .flatten()
            .collect();
        Ok(NotificationBatch {
            command: self.command,
            events,
        })
    }
}

/// Fan-out of flushed batches to subscribers.
///
/// Thin wrapper over a tokio broadcast channel; publishing with zero
/// receivers simply drops the batch.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<NotificationBatch>,
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to batches flushed *after* this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationBatch> {
        self.sender.subscribe()
    }

    pub fn publish(&self, batch: NotificationBatch) {
        // send fails only with zero receivers, which is fine
        let _ = self.sender.send(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> ResourcePath {
        ResourcePath::resource("default", "temp", "dev1", "sensor", "value")
    }

    fn acc() -> NotificationAccumulator {
        NotificationAccumulator::new(CommandId::new())
    }

    #[test]
    fn test_updates_collapse_to_last_value() {
        let mut acc = acc();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(1);

        acc.add_update(
            path(),
            TimedValue::never(),
            TimedValue::new(Value::from(1), t0),
        )
        .unwrap();
        acc.add_update(
            path(),
            TimedValue::new(Value::from(1), t0),
            TimedValue::new(Value::from(2), t1),
        )
        .unwrap();

        let batch = acc.flush().unwrap();
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0] {
            Notification::Update { old, new, .. } => {
                assert_eq!(*old, TimedValue::never());
                assert_eq!(new.value, Some(Value::Integer(2)));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_create_then_delete_is_invisible() {
        let mut acc = acc();
        let p = ResourcePath::provider("default", "temp", "dev1");
        acc.add_lifecycle(LifecycleKind::ProviderAppearing, p.clone())
            .unwrap();
        acc.add_lifecycle(LifecycleKind::ProviderDisappearing, p)
            .unwrap();
        let batch = acc.flush().unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_delete_create_delete_collapses_to_delete() {
        let mut acc = acc();
        let p = ResourcePath::provider("default", "temp", "dev1");
        acc.add_lifecycle(LifecycleKind::ProviderDisappearing, p.clone())
            .unwrap();
        acc.add_lifecycle(LifecycleKind::ProviderAppearing, p.clone())
            .unwrap();
        acc.add_lifecycle(LifecycleKind::ProviderDisappearing, p)
            .unwrap();
        let batch = acc.flush().unwrap();
        assert_eq!(batch.events.len(), 1);
        match &batch.events[0] {
            Notification::Lifecycle { kind, .. } => {
                assert_eq!(*kind, LifecycleKind::ProviderDisappearing);
            }
            other => panic!("expected lifecycle, got {other:?}"),
        }
    }

    #[test]
    fn test_out_of_order_update_rejected() {
        let mut acc = acc();
        let t0 = Utc::now();
        let earlier = t0 - chrono::Duration::seconds(5);

        acc.add_update(
            path(),
            TimedValue::never(),
            TimedValue::new(Value::from(1), t0),
        )
        .unwrap();
        let err = acc
            .add_update(
                path(),
                TimedValue::new(Value::from(1), t0),
                TimedValue::new(Value::from(2), earlier),
            )
            .unwrap_err();
        assert!(matches!(err, GatewayError::StaleWrite { .. }));
    }

    #[test]
    fn test_flush_happens_once() {
        let mut acc = acc();
        acc.flush().unwrap();
        assert!(matches!(
            acc.flush(),
            Err(GatewayError::ConcurrencyMisuse)
        ));
        assert!(matches!(
            acc.add_error(path(), "late"),
            Err(GatewayError::ConcurrencyMisuse)
        ));
    }

    #[test]
    fn test_empty_flush_is_a_batch() {
        let mut acc = acc();
        let batch = acc.flush().unwrap();
        assert!(batch.is_empty());
    }
}
