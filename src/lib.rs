#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

//! Reliable in-process message bus for cooperating code-repair agents.
//!
//! Agents register interest through [`MessageBus::subscribe`] and exchange typed
//! [`Message`]s through [`MessageBus::publish`]. Every publish is deduplicated,
//! oversized payloads are split into chunks, and each recipient is guarded by
//! its own circuit breaker and a timeout/retry policy.

pub mod bus;
pub mod config;
pub mod conversation;
pub mod util;

pub use bus::{
    handler_fn, BusError, ChunkAssembler, ChunkCodec, ChunkError, CircuitBreaker,
    CircuitBreakerSettings, CircuitState, DeliveryRecord, DeliveryReport, Message,
    MessageBus, MessageBusBuilder, MessageHandler, MessageType, MetricsSnapshot, Priority,
    PublishOptions, PublishOutcome, ReassemblingHandler, SubscribeOptions, SubscriptionFilters,
    TypeSelection,
};
pub use config::BusConfig;
pub use conversation::{ConversationStore, InMemoryConversationStore, ThoughtChainSink};
