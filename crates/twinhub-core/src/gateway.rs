//! The gateway thread: the single serialization point of the twin
//!
//! Commands are accepted from any thread and executed strictly one at a
//! time on a dedicated OS thread, so the instance graph needs no locks.
//! Each command runs with a fresh accumulator and a fresh scope
//! generation; its future resolves first, then the accumulated events
//! flush as one batch. A small single-thread tokio runtime owned by the
//! gateway drives asynchronous action futures and fire-and-forget schema
//! persistence.

use crate::command::{Command, CommandFuture, CommandId, CommandScope, ScopeToken};
use crate::error::GatewayError;
use crate::nexus::{Nexus, SchemaRegistry};
use crate::notification::{NotificationAccumulator, NotificationBatch, Notifier};
use crate::storage::ModelStore;
use crate::twin::{DigitalTwin, ProviderSnapshot, ServiceSnapshot};
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Configuration for a gateway instance
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Freshness window for GET at level NORMAL on resources that do not
    /// declare their own cache period
    pub default_cache_period: Duration,

    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_cache_period: Duration::from_millis(500),
            notification_capacity: 256,
        }
    }
}

/// Owned filter variants for [`Gateway::filtered_snapshot`], which must
/// cross onto the gateway thread
pub type SendModelFilter = Box<dyn Fn(&str, &str) -> bool + Send>;
pub type SendProviderFilter = Box<dyn Fn(&ProviderSnapshot) -> bool + Send>;
pub type SendServiceFilter = Box<dyn Fn(&ServiceSnapshot) -> bool + Send>;
pub type SendResourceFilter = Box<dyn Fn(&ProviderSnapshot) -> bool + Send>;

type WorkFn = Box<dyn FnOnce(&DigitalTwin, &SchemaRegistry) + Send>;

struct WorkItem {
    id: CommandId,
    run: WorkFn,
}

/// The command-execution gateway.
///
/// Cheap to share behind an `Arc`; [`Gateway::execute`] may be called
/// from any thread.
pub struct Gateway {
    work: Option<mpsc::UnboundedSender<WorkItem>>,
    thread: Option<thread::JoinHandle<()>>,
    worker: Option<tokio::runtime::Runtime>,
    notifier: Notifier,
}

impl Gateway {
    /// Start a gateway with an empty twin
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        Self::build(config, None)
    }

    /// Start a gateway, restoring persisted models and providers first.
    ///
    /// Restoration is silent (no lifecycle notifications) and cannot bring
    /// back runtime-only hooks such as external getters; registering the
    /// model again from code re-attaches them.
    pub fn with_store(config: GatewayConfig, store: Arc<dyn ModelStore>) -> anyhow::Result<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: GatewayConfig, store: Option<Arc<dyn ModelStore>>) -> anyhow::Result<Self> {
        let worker = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("twinhub-worker")
            .enable_all()
            .build()?;

        let mut nexus = Nexus::new();
        if let Some(store) = &store {
            let definitions = worker.block_on(store.list_models())?;
            let providers = worker.block_on(store.list_providers())?;
            for definition in definitions {
                let name = definition.name.clone();
                if let Err(e) = nexus.register_model(definition) {
                    tracing::warn!(model = %name, error = %e, "skipping stored model");
                }
            }
            for record in providers {
                match nexus.model(&record.namespace, &record.model) {
                    Some(definition) => {
                        if let Err(e) = nexus.create_provider(definition, &record.name) {
                            tracing::warn!(provider = %record.name, error = %e, "skipping stored provider");
                        }
                    }
                    None => {
                        tracing::warn!(
                            provider = %record.name,
                            model = %record.model,
                            "stored provider references a missing model"
                        );
                    }
                }
            }
        }

        let notifier = Notifier::new(config.notification_capacity);
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        let loop_notifier = notifier.clone();
        let loop_worker = worker.handle().clone();
        let loop_store = store.clone();
        let default_cache_period = config.default_cache_period;
        let thread = thread::Builder::new()
            .name("twinhub-gateway".to_string())
            .spawn(move || {
                Self::run_loop(
                    nexus,
                    work_rx,
                    loop_worker,
                    loop_notifier,
                    default_cache_period,
                    loop_store,
                );
            })?;

        Ok(Self {
            work: Some(work_tx),
            thread: Some(thread),
            worker: Some(worker),
            notifier,
        })
    }

    fn run_loop(
        nexus: Nexus,
        mut work: mpsc::UnboundedReceiver<WorkItem>,
        worker: tokio::runtime::Handle,
        notifier: Notifier,
        default_cache_period: Duration,
        store: Option<Arc<dyn ModelStore>>,
    ) {
        let nexus = Rc::new(RefCell::new(nexus));
        let generation = Rc::new(Cell::new(1u64));

        while let Some(item) = work.blocking_recv() {
            tracing::debug!(command = %item.id, "executing command");

            let accumulator = Rc::new(RefCell::new(NotificationAccumulator::new(item.id)));
            let scope = CommandScope::new(
                nexus.clone(),
                accumulator.clone(),
                ScopeToken::new(generation.clone()),
                worker.clone(),
                notifier.clone(),
                default_cache_period,
                store.clone(),
            );
            let twin = DigitalTwin::new(scope.clone());
            let registry = SchemaRegistry::new(scope);

            (item.run)(&twin, &registry);

            // end the scope before flushing so smuggled handles fail fast
            generation.set(generation.get() + 1);

            let flushed = accumulator.borrow_mut().flush();
            match flushed {
                Ok(batch) => notifier.publish(batch),
                Err(e) => {
                    tracing::warn!(command = %item.id, error = %e, "accumulator was already completed");
                }
            }
        }
        tracing::debug!("gateway loop stopped");
    }

    /// Submit a command; the sole mutation/read entry point.
    ///
    /// Returns immediately. The future resolves with the command's result
    /// or with whatever failure ended it; no failure propagates any other
    /// way. Commands run strictly in submission order.
    pub fn execute<T: Send + 'static>(&self, mut command: Command<T>) -> CommandFuture<T> {
        let (sender, receiver) = oneshot::channel();
        let id = command.id();
        let run: WorkFn = Box::new(move |twin, registry| {
            let outcome = catch_unwind(AssertUnwindSafe(|| command.call(twin, registry)));
            let result = match outcome {
                Ok(result) => result,
                Err(_) => Err(GatewayError::CommandPanicked),
            };
            let _ = sender.send(result);
        });

        // a closed or missing queue drops the item, and with it the oneshot
        // sender; the future then resolves to GatewayClosed
        if let Some(work) = &self.work {
            let _ = work.send(WorkItem { id, run });
        }
        CommandFuture::new(receiver)
    }

    /// Receive flushed per-command event batches.
    ///
    /// Only batches flushed after this call are delivered.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationBatch> {
        self.notifier.subscribe()
    }

    /// Off-thread snapshot query; filters apply successively
    /// model → provider → service → resource-value, `None` accepting all.
    pub fn filtered_snapshot(
        &self,
        model: Option<SendModelFilter>,
        provider: Option<SendProviderFilter>,
        service: Option<SendServiceFilter>,
        resources: Option<SendResourceFilter>,
    ) -> CommandFuture<Vec<ProviderSnapshot>> {
        self.execute(Command::new(move |twin, _registry| {
            let model_f: Option<crate::twin::ModelFilter<'_>> = match &model {
                Some(f) => Some(&**f),
                None => None,
            };
            let provider_f: Option<crate::twin::ProviderFilter<'_>> = match &provider {
                Some(f) => Some(&**f),
                None => None,
            };
            let service_f: Option<crate::twin::ServiceFilter<'_>> = match &service {
                Some(f) => Some(&**f),
                None => None,
            };
            let resource_f: Option<crate::twin::ResourceFilter<'_>> = match &resources {
                Some(f) => Some(&**f),
                None => None,
            };
            twin.filtered_snapshot(model_f, provider_f, service_f, resource_f)
        }))
    }

    /// Stop accepting commands, run the queue dry, and join the thread.
    ///
    /// Commands submitted afterwards resolve to `GatewayClosed`.
    pub fn shutdown(&mut self) {
        self.work.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("gateway thread panicked");
            }
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown_background();
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}
