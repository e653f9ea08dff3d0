//! Recipient resolution and bounded handler invocation.
//!
//! The bus lock is taken only for short bookkeeping steps (resolve, breaker
//! gate, metrics, records) and is never held while a handler runs.
//!
//! Chunk fragments leave no delivery records of their own; the facade records
//! the combined outcome under the original message id.

use super::error::BusError;
use super::message::Message;
use super::metrics::DeliveryRecord;
use super::pool::{InvocationOutcome, WorkerPool};
use super::subscription::Subscription;
use super::{BusInner, DeliveryReport, PublishOptions};
use crate::util::truncate_with_ellipsis;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handler error chains can be long; log lines keep only a prefix.
const LOG_ERROR_CHARS: usize = 200;

/// Result of routing one message (or one chunk fragment).
pub(crate) struct RoutedOutcome {
    pub success: bool,
    pub error: Option<BusError>,
    /// Per-recipient reports, in delivery order.
    pub reports: Vec<(String, DeliveryReport)>,
}

impl RoutedOutcome {
    fn unroutable(error: BusError) -> Self {
        Self {
            success: false,
            error: Some(error),
            reports: Vec::new(),
        }
    }
}

pub(crate) struct DeliveryEngine<'a> {
    inner: &'a BusInner,
}

impl<'a> DeliveryEngine<'a> {
    pub fn new(inner: &'a BusInner) -> Self {
        Self { inner }
    }

    /// Route to the receiver, or fan out to every matching agent but the sender.
    pub fn publish_single(&self, message: &Message, options: &PublishOptions) -> RoutedOutcome {
        let matches = self.inner.state.lock().registry.resolve(message);

        if matches.is_empty() {
            tracing::debug!(
                message_id = %message.id,
                message_type = %message.message_type,
                receiver = message.receiver.as_deref().unwrap_or("*"),
                "No matching subscription"
            );
            return RoutedOutcome::unroutable(BusError::NoMatchingSubscription {
                receiver: message.receiver.clone(),
            });
        }

        // A direct message goes to its single best match only. Broadcast
        // matches are already one per agent, highest priority first.
        let recipients = if message.is_broadcast() {
            &matches[..]
        } else {
            &matches[..1]
        };

        let mut reports = Vec::with_capacity(recipients.len());
        for subscription in recipients {
            let report = self.deliver(message, subscription, options);
            reports.push((subscription.agent_id.clone(), report));
        }

        let success = reports.iter().any(|(_, report)| report.success);
        let error = if success {
            None
        } else {
            reports.iter().find_map(|(_, report)| report.error.clone())
        };

        RoutedOutcome {
            success,
            error,
            reports,
        }
    }

    /// Deliver to one subscription under its breaker and retry policy.
    pub fn deliver(
        &self,
        message: &Message,
        subscription: &Subscription,
        options: &PublishOptions,
    ) -> DeliveryReport {
        let agent_id = subscription.agent_id.as_str();

        {
            let mut state = self.inner.state.lock();
            let allowed = state
                .breakers
                .get_mut(agent_id)
                .is_none_or(|breaker| breaker.allow_request());
            if !allowed {
                state.metrics.record_circuit_trip();
                if !message.is_chunk() {
                    state.deliveries.record(
                        &message.id,
                        agent_id,
                        DeliveryRecord::failed(
                            BusError::CircuitOpen {
                                agent_id: agent_id.to_string(),
                            }
                            .to_string(),
                            0,
                        ),
                    );
                }
                drop(state);
                tracing::debug!(
                    message_id = %message.id,
                    agent_id,
                    "Circuit open - delivery skipped"
                );
                return DeliveryReport::failed(
                    BusError::CircuitOpen {
                        agent_id: agent_id.to_string(),
                    },
                    0,
                );
            }
        }

        let timeout = self.effective_timeout(subscription, options);
        let attempts = subscription.max_retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                self.inner.state.lock().metrics.record_retry();
            }

            let started = Instant::now();
            let outcome = match timeout {
                None => WorkerPool::invoke_inline(subscription.handler.as_ref(), message),
                Some(deadline) => self.inner.pool.run_with_deadline(
                    Arc::clone(&subscription.handler),
                    message.clone(),
                    deadline,
                ),
            };

            let error = match outcome {
                InvocationOutcome::Completed(Ok(())) => {
                    let latency = started.elapsed();
                    let mut state = self.inner.state.lock();
                    state.metrics.record_success(latency);
                    if let Some(breaker) = state.breakers.get_mut(agent_id) {
                        breaker.record_success();
                    }
                    if !message.is_chunk() {
                        state
                            .deliveries
                            .record(&message.id, agent_id, DeliveryRecord::succeeded(attempt));
                    }
                    return DeliveryReport::succeeded(attempt);
                }
                InvocationOutcome::Completed(Err(e)) => BusError::callback(format!("{e:#}")),
                InvocationOutcome::Panicked => BusError::callback("handler panicked"),
                InvocationOutcome::TimedOut => {
                    self.inner.state.lock().metrics.record_timeout();
                    BusError::Timeout {
                        after_ms: timeout.map_or(0, |d| d.as_millis() as u64),
                    }
                }
                InvocationOutcome::Unavailable(reason) => BusError::callback(reason),
            };

            tracing::debug!(
                message_id = %message.id,
                agent_id,
                attempt,
                error = %truncate_with_ellipsis(&error.to_string(), LOG_ERROR_CHARS),
                "Delivery attempt failed"
            );
            if !message.is_chunk() {
                self.inner.state.lock().deliveries.record(
                    &message.id,
                    agent_id,
                    DeliveryRecord::failed(error.to_string(), attempt),
                );
            }
            last_error = Some(error);
        }

        {
            let mut state = self.inner.state.lock();
            if let Some(breaker) = state.breakers.get_mut(agent_id) {
                breaker.record_failure();
            }
            state.metrics.record_failure();
        }

        let error = last_error.unwrap_or_else(|| BusError::callback("delivery failed"));
        tracing::warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            agent_id,
            attempts,
            error = %truncate_with_ellipsis(&error.to_string(), LOG_ERROR_CHARS),
            "Delivery failed after all attempts"
        );
        DeliveryReport::failed(error, attempts - 1)
    }

    /// Publish-level timeout wins over the subscription's. A confirmation
    /// request without either falls back to the configured bound.
    fn effective_timeout(
        &self,
        subscription: &Subscription,
        options: &PublishOptions,
    ) -> Option<Duration> {
        options.timeout.or(subscription.timeout).or_else(|| {
            options
                .require_confirmation
                .then(|| self.inner.config.confirmation_timeout())
        })
    }
}
