//! In-process message bus for cooperating repair agents.
//!
//! ```text
//! publish → dedup → (oversized ⇒ split into chunks) → for each message:
//!     resolve recipients → breaker gate → bounded handler call
//!     → metrics / delivery record → breaker feedback
//! ```
//!
//! All registries live in one `BusState` behind a single mutex. The lock is
//! released before any handler runs, so handlers may publish from inside a
//! callback.

mod breaker;
mod chunk;
mod dedup;
mod delivery;
mod error;
mod handler;
mod message;
mod metrics;
mod pool;
mod subscription;

pub use breaker::{CircuitBreaker, CircuitBreakerSettings, CircuitBreakerSnapshot, CircuitState};
pub use chunk::{
    ChunkAssembler, ChunkCodec, ChunkError, ChunkSettings, ReassemblingHandler,
    DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use dedup::MessageDeduplicator;
pub use error::BusError;
pub use handler::{handler_fn, MessageHandler};
pub use message::{ChunkHeader, Message, MessageType, Priority};
pub use metrics::{DeliveryRecord, MetricsSnapshot, DEFAULT_MAX_DELIVERY_RECORDS};
pub use subscription::{
    SubscribeOptions, Subscription, SubscriptionFilters, SubscriptionRegistry, TypeSelection,
    DEFAULT_MAX_RETRIES,
};

use crate::config::BusConfig;
use crate::conversation::{thought_for, ConversationStore, ThoughtChainSink};
use delivery::DeliveryEngine;
use metrics::{BusMetrics, DeliveryStatusTracker};
use parking_lot::Mutex;
use pool::WorkerPool;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-call publish options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Overrides the message's own priority when set.
    pub priority: Option<Priority>,
    /// Bounds every recipient's handler call, overriding subscription timeouts.
    pub timeout: Option<Duration>,
    /// Never wait unboundedly: recipients without any timeout get the
    /// configured confirmation timeout.
    pub require_confirmation: bool,
}

impl PublishOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn require_confirmation(mut self) -> Self {
        self.require_confirmation = true;
        self
    }
}

/// Outcome for one recipient of one publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub success: bool,
    pub error: Option<BusError>,
    /// Attempts beyond the first.
    pub retry_count: u32,
}

impl DeliveryReport {
    fn succeeded(retry_count: u32) -> Self {
        Self {
            success: true,
            error: None,
            retry_count,
        }
    }

    fn failed(error: BusError, retry_count: u32) -> Self {
        Self {
            success: false,
            error: Some(error),
            retry_count,
        }
    }

    /// Fold a fragment's report into the per-agent total of a chunked publish.
    fn absorb(&mut self, other: DeliveryReport) {
        self.success &= other.success;
        if self.error.is_none() {
            self.error = other.error;
        }
        self.retry_count += other.retry_count;
    }

    fn to_record(&self) -> DeliveryRecord {
        match &self.error {
            Some(error) if !self.success => {
                DeliveryRecord::failed(error.to_string(), self.retry_count)
            }
            _ => DeliveryRecord::succeeded(self.retry_count),
        }
    }
}

/// Result of [`MessageBus::publish`]. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishOutcome {
    pub success: bool,
    pub message_id: String,
    pub chunked: bool,
    /// Fragment count when `chunked`.
    pub chunks: Option<usize>,
    pub error: Option<BusError>,
    pub delivery_status: HashMap<String, DeliveryReport>,
}

impl PublishOutcome {
    fn rejected(message_id: String, error: BusError) -> Self {
        Self {
            success: false,
            message_id,
            chunked: false,
            chunks: None,
            error: Some(error),
            delivery_status: HashMap::new(),
        }
    }
}

pub(crate) struct BusState {
    pub registry: SubscriptionRegistry,
    pub breakers: HashMap<String, CircuitBreaker>,
    pub dedup: MessageDeduplicator,
    pub metrics: BusMetrics,
    pub deliveries: DeliveryStatusTracker,
}

pub(crate) struct BusInner {
    pub state: Mutex<BusState>,
    pub pool: WorkerPool,
    pub config: BusConfig,
    codec: ChunkCodec,
    assembler: ChunkAssembler,
    breaker_settings: CircuitBreakerSettings,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    thought_sink: Option<Arc<dyn ThoughtChainSink>>,
}

/// Cheaply cloneable handle to one bus instance.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a bus with a custom config or collaborators.
#[derive(Default)]
pub struct MessageBusBuilder {
    config: BusConfig,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    thought_sink: Option<Arc<dyn ThoughtChainSink>>,
}

impl MessageBusBuilder {
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversation_store = Some(store);
        self
    }

    pub fn thought_sink(mut self, sink: Arc<dyn ThoughtChainSink>) -> Self {
        self.thought_sink = Some(sink);
        self
    }

    /// Fails only on invalid configuration.
    pub fn build(self) -> anyhow::Result<MessageBus> {
        self.config.validate()?;
        Ok(MessageBus::from_parts(
            self.config,
            self.conversation_store,
            self.thought_sink,
        ))
    }
}

impl MessageBus {
    /// A bus with default configuration and no collaborators.
    pub fn new() -> Self {
        Self::from_parts(BusConfig::default(), None, None)
    }

    pub fn with_config(config: BusConfig) -> anyhow::Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> MessageBusBuilder {
        MessageBusBuilder::default()
    }

    fn from_parts(
        config: BusConfig,
        conversation_store: Option<Arc<dyn ConversationStore>>,
        thought_sink: Option<Arc<dyn ThoughtChainSink>>,
    ) -> Self {
        let codec = ChunkCodec::new(config.chunk_settings());
        let state = BusState {
            registry: SubscriptionRegistry::with_default_max_retries(
                config.delivery.default_max_retries,
            ),
            breakers: HashMap::new(),
            dedup: MessageDeduplicator::new(config.dedup.capacity, config.dedup_ttl()),
            metrics: BusMetrics::default(),
            deliveries: DeliveryStatusTracker::new(config.delivery.max_delivery_records),
        };
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(state),
                pool: WorkerPool::new(config.delivery.worker_threads),
                breaker_settings: config.breaker_settings(),
                assembler: ChunkAssembler::new(codec.clone()),
                codec,
                config,
                conversation_store,
                thought_sink,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Register interest, merging with any existing subscription of `agent_id`.
    ///
    /// Only programmer errors (empty agent id, non-finite confidence filter)
    /// are returned as `Err`.
    pub fn subscribe<H>(
        &self,
        agent_id: &str,
        types: impl Into<TypeSelection>,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<(), BusError>
    where
        H: MessageHandler + 'static,
    {
        self.subscribe_shared(agent_id, types, Arc::new(handler), options)
    }

    /// Like [`MessageBus::subscribe`] for a handler that is already shared.
    pub fn subscribe_shared(
        &self,
        agent_id: &str,
        types: impl Into<TypeSelection>,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<(), BusError> {
        let types = types.into();
        let mut state = self.inner.state.lock();
        let created = state.registry.subscribe(agent_id, types, handler, options)?;
        if created {
            let settings = self.inner.breaker_settings;
            state
                .breakers
                .entry(agent_id.to_string())
                .or_insert_with(|| CircuitBreaker::new(agent_id, settings));
            tracing::debug!(agent_id, "Agent subscribed");
        }
        Ok(())
    }

    /// Single-type [`MessageBus::subscribe`] with default options.
    pub fn register_handler<H>(
        &self,
        agent_id: &str,
        message_type: MessageType,
        handler: H,
    ) -> Result<(), BusError>
    where
        H: MessageHandler + 'static,
    {
        self.subscribe(agent_id, message_type, handler, SubscribeOptions::default())
    }

    /// Remove types; dropping the last one removes the subscription and its breaker.
    pub fn unsubscribe(&self, agent_id: &str, types: impl Into<TypeSelection>) {
        let types = types.into();
        let mut state = self.inner.state.lock();
        if state.registry.unsubscribe(agent_id, &types) {
            state.breakers.remove(agent_id);
            tracing::debug!(agent_id, "Agent unsubscribed");
        }
    }

    /// Route a message. Never panics or returns `Err`; see [`PublishOutcome`].
    pub fn publish(&self, mut message: Message, options: PublishOptions) -> PublishOutcome {
        if let Some(priority) = options.priority {
            message.priority = priority;
        }

        {
            let mut state = self.inner.state.lock();
            if state.dedup.is_duplicate(&message.id) {
                state.metrics.record_duplicate();
                drop(state);
                tracing::debug!(message_id = %message.id, "Rejecting duplicate message");
                let error = BusError::DuplicateMessage {
                    message_id: message.id.clone(),
                };
                return PublishOutcome::rejected(message.id, error);
            }
            state.dedup.mark_processed(&message.id);
            state.metrics.record_publish(&message);
        }

        self.forward_to_collaborators(&message);

        let chunks = match self.inner.codec.split_if_oversized(&message) {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "Failed to encode message");
                let error = BusError::Serialization {
                    reason: e.to_string(),
                };
                return PublishOutcome::rejected(message.id, error);
            }
        };

        let engine = DeliveryEngine::new(&self.inner);
        let Some(chunks) = chunks else {
            let routed = engine.publish_single(&message, &options);
            return PublishOutcome {
                success: routed.success,
                message_id: message.id,
                chunked: false,
                chunks: None,
                error: routed.error,
                delivery_status: routed.reports.into_iter().collect(),
            };
        };

        let total = chunks.len();
        self.inner.state.lock().metrics.record_chunked(total);
        tracing::debug!(
            message_id = %message.id,
            chunks = total,
            "Publishing oversized message in chunks"
        );

        let mut success = true;
        let mut first_error = None;
        let mut per_agent: HashMap<String, DeliveryReport> = HashMap::new();
        for chunk in &chunks {
            let routed = engine.publish_single(chunk, &options);
            if !routed.success {
                success = false;
                if first_error.is_none() {
                    first_error = routed.error;
                }
            }
            for (agent_id, report) in routed.reports {
                match per_agent.get_mut(&agent_id) {
                    Some(combined) => combined.absorb(report),
                    None => {
                        per_agent.insert(agent_id, report);
                    }
                }
            }
        }

        {
            let mut state = self.inner.state.lock();
            for (agent_id, report) in &per_agent {
                state
                    .deliveries
                    .record(&message.id, agent_id, report.to_record());
            }
        }

        PublishOutcome {
            success,
            message_id: message.id,
            chunked: true,
            chunks: Some(total),
            error: first_error,
            delivery_status: per_agent,
        }
    }

    fn forward_to_collaborators(&self, message: &Message) {
        if let Some(store) = &self.inner.conversation_store {
            if let Err(e) = store.append(message) {
                tracing::warn!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to append message to conversation store"
                );
            }
        }
        if let Some(sink) = &self.inner.thought_sink {
            if let Err(e) = sink.record_thought(&message.sender, thought_for(message)) {
                tracing::warn!(
                    message_id = %message.id,
                    error = %e,
                    "Failed to forward thought"
                );
            }
        }
    }

    /// Rebuild a message from a complete set of fragments.
    pub fn reassemble_chunks(&self, chunks: &[Message]) -> Option<Message> {
        self.inner.codec.reassemble(chunks)
    }

    /// Feed one fragment into the bus-wide assembler.
    pub fn accept_chunk(&self, chunk: Message) -> Result<Option<Message>, ChunkError> {
        self.inner.assembler.accept(chunk)
    }

    /// Latest record per recipient.
    pub fn delivery_status(&self, message_id: &str) -> HashMap<String, DeliveryRecord> {
        self.inner.state.lock().deliveries.status(message_id)
    }

    pub fn clear_delivery_status(&self, message_id: &str) -> bool {
        self.inner.state.lock().deliveries.clear(message_id)
    }

    /// Drop every delivery record. Returns how many messages were tracked.
    pub fn cleanup_delivery_records(&self) -> usize {
        self.inner.state.lock().deliveries.clear_all()
    }

    pub fn performance_metrics(&self) -> MetricsSnapshot {
        self.inner.state.lock().metrics.snapshot()
    }

    pub fn circuit_state(&self, agent_id: &str) -> Option<CircuitState> {
        self.inner
            .state
            .lock()
            .breakers
            .get(agent_id)
            .map(CircuitBreaker::state)
    }

    pub fn circuit_snapshot(&self, agent_id: &str) -> Option<CircuitBreakerSnapshot> {
        self.inner
            .state
            .lock()
            .breakers
            .get(agent_id)
            .map(CircuitBreaker::snapshot)
    }

    /// Subscribed agents in subscription order.
    pub fn subscribed_agents(&self) -> Vec<String> {
        self.inner.state.lock().registry.agents()
    }

    /// Drain in-flight pooled handlers (bounded by the configured drain
    /// timeout), then clear every registry. The bus stays usable afterwards.
    pub fn shutdown(&self) {
        let drain = self.inner.config.shutdown_drain_timeout();
        tracing::info!(drain_ms = drain.as_millis() as u64, "Shutting down message bus");
        self.inner.pool.shutdown(drain);

        let mut state = self.inner.state.lock();
        state.registry.clear();
        state.breakers.clear();
        state.dedup.clear();
        state.deliveries.clear_all();
        state.metrics.reset();
        drop(state);
        self.inner.assembler.discard_stale(Duration::ZERO);
    }
}
