//! GraphManager - トランザクションの受付と直列実行
//!
//! The manager owns the fulfillment cache, the root workspace and a queue
//! with concurrency 1: transactions run one after another, while the
//! partitions inside one transaction run in parallel on the transaction's
//! own queue.

use std::sync::{Arc, Weak};

use chrono::Duration;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{FulfillmentCache, FulfillmentEntry};
use crate::config::{ConfigError, ManagerConfig, TransportConfig};
use crate::domain::{EntityDescription, StoreRequest, TaskError};
use crate::impls::{
    HttpTransport, InMemoryWorkspace, JsonDecoder, MetadataTtlPolicy, TemplateRequestBuilder,
};
use crate::observability::{ManagerStats, QueueCounts};
use crate::ports::{
    Clock, Collaborators, PayloadDecoder, RequestBuilder, SystemClock, Transport, TransportError,
    TtlPolicy, Workspace,
};
use crate::queue::{QueueDelegate, TaskQueue};
use crate::task::Task;
use crate::transaction::{Transaction, TransactionContext};

pub use crate::config::ResetPolicy;

/// Caller hooks consulted while the manager is built and used.
pub trait ManagerHooks: Send + Sync {
    /// Transport settings used when the manager builds its own transport.
    fn transport_config(&self, default: TransportConfig) -> TransportConfig {
        default
    }

    fn time_to_live(&self, _entity: &EntityDescription, default: Duration) -> Duration {
        default
    }

    fn reset_policy(&self, default: ResetPolicy) -> ResetPolicy {
        default
    }

    /// Adjust a request (typically its URL overrides) before its
    /// transaction is built.
    fn prepare_request(&self, _request: &mut StoreRequest) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ManagerHooks for DefaultHooks {}

/// TTL policy that lets the hooks have the last word.
struct HookedTtl {
    policy: Arc<dyn TtlPolicy>,
    hooks: Arc<dyn ManagerHooks>,
}

impl TtlPolicy for HookedTtl {
    fn ttl_for(&self, entity: &EntityDescription) -> Duration {
        self.hooks.time_to_live(entity, self.policy.ttl_for(entity))
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build transport: {0}")]
    Transport(#[from] TransportError),

    #[error("partition_concurrency must be at least 1")]
    ZeroConcurrency,
}

/// Wires a `GraphManager` from configuration, filling in any collaborator
/// that was not given explicitly.
pub struct GraphManagerBuilder {
    config: ManagerConfig,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn Transport>>,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    request_builder: Option<Arc<dyn RequestBuilder>>,
    ttl: Option<Arc<dyn TtlPolicy>>,
    workspace: Option<Arc<dyn Workspace>>,
    hooks: Arc<dyn ManagerHooks>,
}

impl GraphManagerBuilder {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            clock: None,
            transport: None,
            decoder: None,
            request_builder: None,
            ttl: None,
            workspace: None,
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn request_builder(mut self, request_builder: Arc<dyn RequestBuilder>) -> Self {
        self.request_builder = Some(request_builder);
        self
    }

    pub fn ttl_policy(mut self, ttl: Arc<dyn TtlPolicy>) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Root workspace that finished transactions commit into.
    pub fn workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ManagerHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// # Panics
    /// Outside a Tokio runtime (the manager queue spawns its driver).
    pub fn build(self) -> Result<GraphManager, BuildError> {
        let config = self.config;
        if config.partition_concurrency == Some(0) {
            return Err(BuildError::ZeroConcurrency);
        }
        let hooks = self.hooks;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let transport_config = hooks.transport_config(config.transport.clone());
                Arc::new(HttpTransport::new(&transport_config)?)
            }
        };
        let request_builder: Arc<dyn RequestBuilder> = match self.request_builder {
            Some(builder) => builder,
            None => Arc::new(TemplateRequestBuilder::new(config.base_url()?)),
        };
        let ttl: Arc<dyn TtlPolicy> = self
            .ttl
            .unwrap_or_else(|| Arc::new(MetadataTtlPolicy::from_secs(config.default_ttl_secs)));

        let collaborators = Collaborators {
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            transport,
            decoder: self.decoder.unwrap_or_else(|| Arc::new(JsonDecoder)),
            request_builder,
            ttl: Arc::new(HookedTtl {
                policy: ttl,
                hooks: hooks.clone(),
            }),
        };
        let context = TransactionContext {
            collaborators,
            cache: Arc::new(FulfillmentCache::new()),
            workspace: self
                .workspace
                .unwrap_or_else(|| Arc::new(InMemoryWorkspace::new())),
            partition_concurrency: config.partition_concurrency,
        };

        let queue = TaskQueue::new(format!("{}.transactions", config.name), Some(1));
        let inner = Arc::new(ManagerInner {
            config,
            queue,
            context,
            hooks,
            stats: Mutex::new(ManagerStats::default()),
        });
        let delegate: Weak<ManagerInner> = Arc::downgrade(&inner);
        inner.queue.set_delegate(delegate);

        info!(manager = %inner.config.name, "graph manager ready");
        Ok(GraphManager { inner })
    }
}

struct ManagerInner {
    config: ManagerConfig,
    queue: TaskQueue,
    context: TransactionContext,
    hooks: Arc<dyn ManagerHooks>,
    stats: Mutex<ManagerStats>,
}

impl QueueDelegate for ManagerInner {
    fn will_add_task(&self, _queue: &TaskQueue, task: &Task) {
        debug!(manager = %self.config.name, transaction = %task.name(), "transaction queued");
    }

    fn did_finish_task(&self, _queue: &TaskQueue, task: &Task, errors: &[TaskError]) {
        let mut stats = self.stats.lock();
        stats.finished += 1;
        if !errors.is_empty() {
            stats.failed += 1;
        }
        debug!(manager = %self.config.name, transaction = %task.name(), errors = errors.len(), "transaction done");
    }
}

/// Entry point: turns store requests into transactions and runs them.
#[derive(Clone)]
pub struct GraphManager {
    inner: Arc<ManagerInner>,
}

impl GraphManager {
    pub fn builder(config: ManagerConfig) -> GraphManagerBuilder {
        GraphManagerBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn workspace(&self) -> &Arc<dyn Workspace> {
        &self.inner.context.workspace
    }

    /// Build a transaction for `request` and queue it behind every
    /// transaction already queued.
    pub fn submit(&self, request: impl Into<StoreRequest>) -> Transaction {
        let mut request = request.into();
        self.inner.hooks.prepare_request(&mut request);

        let transaction = Transaction::new(request, &self.inner.context);
        for earlier in self.inner.queue.tasks() {
            transaction.task().add_dependency(&earlier);
        }
        self.inner.stats.lock().submitted += 1;
        info!(
            manager = %self.inner.config.name,
            transaction = %transaction.id(),
            entity = transaction.request().entity().map(|e| e.name.as_str()).unwrap_or(""),
            partitions = transaction.partitions().len(),
            "transaction submitted"
        );

        self.inner.queue.add_task(transaction.task().clone());
        transaction
    }

    /// Submit and wait for the transaction's combined errors.
    pub async fn execute(&self, request: impl Into<StoreRequest>) -> Vec<TaskError> {
        self.submit(request).wait().await
    }

    /// Cancel and drain every queued transaction, forget every fulfillment,
    /// apply the reset policy to the root workspace and zero the counters.
    pub async fn reset(&self) {
        let inner = &self.inner;
        inner.queue.cancel_all();
        inner.queue.wait_all().await;
        inner.context.cache.clear();

        let policy = inner.hooks.reset_policy(inner.config.reset_policy);
        if policy == ResetPolicy::Discard {
            inner.context.workspace.reset();
        }
        *inner.stats.lock() = ManagerStats::default();
        info!(manager = %inner.config.name, ?policy, "graph manager reset");
    }

    /// The fulfillment ledger, soonest expiry first.
    pub fn fulfillment_entries(&self) -> Vec<FulfillmentEntry> {
        self.inner.context.cache.entries()
    }

    pub fn stats(&self) -> ManagerStats {
        *self.inner.stats.lock()
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.inner.queue.counts()
    }
}

impl std::fmt::Debug for GraphManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphManager")
            .field("name", &self.inner.config.name)
            .field("queue", &self.inner.queue)
            .field("stats", &self.stats())
            .finish()
    }
}
