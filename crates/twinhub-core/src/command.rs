//! Single-use units of work executed on the gateway thread
//!
//! A [`Command`] is built on any thread, submitted through
//! [`Gateway::execute`](crate::gateway::Gateway::execute), and invoked
//! exactly once with the command-scoped twin and registry views. Validity
//! of everything those views hand out is tied to a [`ScopeToken`]: a
//! generation lease that expires the moment the command body returns.

use crate::error::{GatewayError, Result};
use crate::model::ModelDefinition;
use crate::nexus::{Nexus, SchemaRegistry};
use crate::notification::{NotificationAccumulator, Notifier};
use crate::storage::{ModelStore, StoredProvider};
use crate::twin::DigitalTwin;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Unique identifier for a command (and the notification batch it flushes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub Uuid);

impl CommandId {
    /// Create a new unique command ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation lease proving a scoped object is still inside its
/// originating command's execution window.
///
/// The gateway bumps the shared generation after every command; a token
/// minted during execution stops matching at that point and every accessor
/// holding it fails with `ConcurrencyMisuse`.
#[derive(Clone)]
pub struct ScopeToken {
    current: Rc<Cell<u64>>,
    generation: u64,
}

impl ScopeToken {
    pub(crate) fn new(current: Rc<Cell<u64>>) -> Self {
        let generation = current.get();
        Self {
            current,
            generation,
        }
    }

    /// True only while the originating command is executing
    pub fn is_valid(&self) -> bool {
        self.current.get() == self.generation
    }

    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(GatewayError::ConcurrencyMisuse)
        }
    }
}

/// Everything a command-scoped view needs to reach the twin.
///
/// Holds `Rc` clones of the gateway thread's state, which keeps every view
/// `!Send`: scoped objects cannot leave the gateway thread at all, and the
/// token catches temporal escape within it.
#[derive(Clone)]
pub(crate) struct CommandScope {
    nexus: Rc<RefCell<Nexus>>,
    accumulator: Rc<RefCell<NotificationAccumulator>>,
    token: ScopeToken,
    worker: tokio::runtime::Handle,
    notifier: Notifier,
    default_cache_period: Duration,
    store: Option<Arc<dyn ModelStore>>,
}

impl CommandScope {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        nexus: Rc<RefCell<Nexus>>,
        accumulator: Rc<RefCell<NotificationAccumulator>>,
        token: ScopeToken,
        worker: tokio::runtime::Handle,
        notifier: Notifier,
        default_cache_period: Duration,
        store: Option<Arc<dyn ModelStore>>,
    ) -> Self {
        Self {
            nexus,
            accumulator,
            token,
            worker,
            notifier,
            default_cache_period,
            store,
        }
    }

    pub(crate) fn nexus(&self) -> &Rc<RefCell<Nexus>> {
        &self.nexus
    }

    pub(crate) fn accumulator(&self) -> &Rc<RefCell<NotificationAccumulator>> {
        &self.accumulator
    }

    pub(crate) fn token(&self) -> &ScopeToken {
        &self.token
    }

    pub(crate) fn worker(&self) -> &tokio::runtime::Handle {
        &self.worker
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) fn default_cache_period(&self) -> Duration {
        self.default_cache_period
    }

    /// Persist a registered model, fire and forget
    pub(crate) fn persist_model(&self, definition: &Arc<ModelDefinition>) {
        if let Some(store) = &self.store {
            let store = store.clone();
            let def = ModelDefinition::clone(definition);
            self.worker.spawn(async move {
                if let Err(e) = store.save_model(&def).await {
                    tracing::warn!(model = %def.name, error = %e, "failed to persist model");
                }
            });
        }
    }

    pub(crate) fn persist_provider(&self, record: StoredProvider) {
        if let Some(store) = &self.store {
            let store = store.clone();
            self.worker.spawn(async move {
                if let Err(e) = store.save_provider(&record).await {
                    tracing::warn!(provider = %record.name, error = %e, "failed to persist provider");
                }
            });
        }
    }

    pub(crate) fn remove_persisted_model(&self, namespace: String, name: String) {
        if let Some(store) = &self.store {
            let store = store.clone();
            self.worker.spawn(async move {
                if let Err(e) = store.delete_model(&namespace, &name).await {
                    tracing::warn!(model = %name, error = %e, "failed to delete persisted model");
                }
            });
        }
    }

    pub(crate) fn remove_persisted_provider(&self, name: String) {
        if let Some(store) = &self.store {
            let store = store.clone();
            self.worker.spawn(async move {
                if let Err(e) = store.delete_provider(&name).await {
                    tracing::warn!(provider = %name, error = %e, "failed to delete persisted provider");
                }
            });
        }
    }
}

type CommandBody<T> =
    Box<dyn FnOnce(&DigitalTwin, &SchemaRegistry) -> Result<T> + Send + 'static>;

/// A single-use unit of work.
///
/// The body receives the digital twin (reads) and the schema registry
/// (structural mutation) and produces the value the submitted future
/// resolves to. A second `call` fails with [`GatewayError::Reuse`] so a
/// replayed command cannot duplicate side effects or notifications.
pub struct Command<T> {
    id: CommandId,
    body: Option<CommandBody<T>>,
}

impl<T> Command<T> {
    pub fn new(
        body: impl FnOnce(&DigitalTwin, &SchemaRegistry) -> Result<T> + Send + 'static,
    ) -> Self {
        Self {
            id: CommandId::new(),
            body: Some(Box::new(body)),
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Invoke the command body; the second invocation fails with `Reuse`
    pub fn call(&mut self, twin: &DigitalTwin, registry: &SchemaRegistry) -> Result<T> {
        match self.body.take() {
            Some(body) => body(twin, registry),
            None => Err(GatewayError::Reuse(self.id.0)),
        }
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("consumed", &self.body.is_none())
            .finish()
    }
}

/// One-shot future for a submitted command or dispatched action.
///
/// Resolves exactly once, either with the produced value or with the
/// failure that ended the command. Await it from async code, or use
/// [`CommandFuture::wait`] from a plain thread.
pub struct CommandFuture<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> CommandFuture<T> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self { receiver }
    }

    /// A future that is already resolved
    pub(crate) fn ready(result: Result<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }

    /// Block the calling thread until the result arrives.
    ///
    /// Must not be called from async context; use `.await` there.
    pub fn wait(self) -> Result<T> {
        match self.receiver.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(GatewayError::GatewayClosed),
        }
    }
}

impl<T> fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFuture").finish_non_exhaustive()
    }
}

impl<T> Future for CommandFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(GatewayError::GatewayClosed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids_are_unique() {
        assert_ne!(CommandId::new(), CommandId::new());
    }

    #[test]
    fn test_scope_token_expires_with_generation() {
        let generation = Rc::new(Cell::new(1));
        let token = ScopeToken::new(generation.clone());
        assert!(token.is_valid());

        generation.set(2);
        assert!(!token.is_valid());
        assert!(matches!(
            token.ensure_valid(),
            Err(GatewayError::ConcurrencyMisuse)
        ));
    }

    #[test]
    fn test_ready_future_resolves() {
        let fut = CommandFuture::ready(Ok(7));
        assert_eq!(fut.wait().unwrap(), 7);
    }
}
