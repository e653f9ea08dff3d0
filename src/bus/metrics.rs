//! Aggregate counters and per-(message, recipient) delivery records.

use super::message::{Message, MessageType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

pub const DEFAULT_MAX_DELIVERY_RECORDS: usize = 10_000;

/// Point-in-time copy of the bus counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    /// Accepted publishes. Duplicates are counted separately.
    pub total_messages: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    /// Attempts beyond the first for any recipient.
    pub retried_deliveries: u64,
    pub timeouts: u64,
    /// Deliveries refused by an open circuit.
    pub circuit_trips: u64,
    pub duplicates_rejected: u64,
    pub chunked_messages: u64,
    pub chunks_emitted: u64,
    /// Mean over successful deliveries.
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    pub messages_by_type: BTreeMap<String, u64>,
    pub messages_by_sender: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub(crate) struct BusMetrics {
    total_messages: u64,
    successful_deliveries: u64,
    failed_deliveries: u64,
    retried_deliveries: u64,
    timeouts: u64,
    circuit_trips: u64,
    duplicates_rejected: u64,
    chunked_messages: u64,
    chunks_emitted: u64,
    latency_samples: u64,
    average_latency_ms: f64,
    max_latency_ms: f64,
    by_type: BTreeMap<MessageType, u64>,
    by_sender: BTreeMap<String, u64>,
}

impl BusMetrics {
    pub fn record_publish(&mut self, message: &Message) {
        self.total_messages += 1;
        *self.by_type.entry(message.message_type).or_insert(0) += 1;
        *self.by_sender.entry(message.sender.clone()).or_insert(0) += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_rejected += 1;
    }

    pub fn record_chunked(&mut self, chunks: usize) {
        self.chunked_messages += 1;
        self.chunks_emitted += chunks as u64;
    }

    pub fn record_success(&mut self, latency: Duration) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.successful_deliveries += 1;
        self.latency_samples += 1;
        // Running mean
        self.average_latency_ms +=
            (latency_ms - self.average_latency_ms) / self.latency_samples as f64;
        if latency_ms > self.max_latency_ms {
            self.max_latency_ms = latency_ms;
        }
    }

    pub fn record_failure(&mut self) {
        self.failed_deliveries += 1;
    }

    pub fn record_retry(&mut self) {
        self.retried_deliveries += 1;
    }

    pub fn record_timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn record_circuit_trip(&mut self) {
        self.circuit_trips += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_messages: self.total_messages,
            successful_deliveries: self.successful_deliveries,
            failed_deliveries: self.failed_deliveries,
            retried_deliveries: self.retried_deliveries,
            timeouts: self.timeouts,
            circuit_trips: self.circuit_trips,
            duplicates_rejected: self.duplicates_rejected,
            chunked_messages: self.chunked_messages,
            chunks_emitted: self.chunks_emitted,
            average_latency_ms: self.average_latency_ms,
            max_latency_ms: self.max_latency_ms,
            messages_by_type: self
                .by_type
                .iter()
                .map(|(ty, count)| (ty.as_str().to_string(), *count))
                .collect(),
            messages_by_sender: self.by_sender.clone(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of the latest delivery attempt of one message to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
    /// Attempts made beyond the first.
    pub retry_count: u32,
}

impl DeliveryRecord {
    pub fn succeeded(retry_count: u32) -> Self {
        Self {
            success: true,
            timestamp: Utc::now(),
            error: None,
            retry_count,
        }
    }

    pub fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            success: false,
            timestamp: Utc::now(),
            error: Some(error.into()),
            retry_count,
        }
    }
}

/// Delivery records keyed by message id, bounded by message count.
///
/// Records normally live until `clear`/`clear_all` or bus shutdown. The
/// `max_messages` bound is the one exception: once it is reached, the records
/// of the oldest tracked message are dropped to make room, so a long-running
/// bus cannot grow without limit.
#[derive(Debug)]
pub(crate) struct DeliveryStatusTracker {
    records: HashMap<String, HashMap<String, DeliveryRecord>>,
    order: VecDeque<String>,
    max_messages: usize,
}

impl DeliveryStatusTracker {
    pub fn new(max_messages: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: VecDeque::new(),
            max_messages: max_messages.max(1),
        }
    }

    pub fn record(&mut self, message_id: &str, agent_id: &str, record: DeliveryRecord) {
        if !self.records.contains_key(message_id) {
            while self.order.len() >= self.max_messages {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.records.remove(&oldest);
            }
            self.order.push_back(message_id.to_string());
        }
        self.records
            .entry(message_id.to_string())
            .or_default()
            .insert(agent_id.to_string(), record);
    }

    pub fn status(&self, message_id: &str) -> HashMap<String, DeliveryRecord> {
        self.records.get(message_id).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self, message_id: &str) -> bool {
        if self.records.remove(message_id).is_some() {
            self.order.retain(|id| id != message_id);
            true
        } else {
            false
        }
    }

    /// Returns the number of messages whose records were dropped.
    pub fn clear_all(&mut self) -> usize {
        let dropped = self.records.len();
        self.records.clear();
        self.order.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}
