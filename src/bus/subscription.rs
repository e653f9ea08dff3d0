//! Per-agent subscriptions and recipient resolution.

use super::error::BusError;
use super::handler::MessageHandler;
use super::message::{Message, MessageType, Priority};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Metadata key under which chunk fragments carry their original type.
pub(crate) const ORIGINAL_TYPE_KEY: &str = "original_message_type";
/// Top-level keys of the original content, listed on every fragment.
pub(crate) const ORIGINAL_KEYS_KEY: &str = "original_content_keys";

/// Which message types a subscribe/unsubscribe call refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSelection {
    All,
    Only(Vec<MessageType>),
}

impl TypeSelection {
    pub fn one(message_type: MessageType) -> Self {
        Self::Only(vec![message_type])
    }

    pub fn of(types: impl IntoIterator<Item = MessageType>) -> Self {
        Self::Only(types.into_iter().collect())
    }

    /// Expand to a concrete set. An empty `Only` means every type.
    fn expand(&self) -> BTreeSet<MessageType> {
        match self {
            Self::Only(types) if !types.is_empty() => types.iter().copied().collect(),
            _ => MessageType::ALL.into_iter().collect(),
        }
    }
}

impl From<MessageType> for TypeSelection {
    fn from(value: MessageType) -> Self {
        Self::one(value)
    }
}

/// Filters applied after type and addressing checks.
///
/// Keys that the bus does not understand are kept in `extra` and ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionFilters {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub required_content_keys: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SubscriptionFilters {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = Some(min_confidence);
        self
    }

    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_content_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Build filters from a loose JSON object, e.g. one received over a config file.
    pub fn from_json(value: Value) -> Result<Self, BusError> {
        serde_json::from_value(value).map_err(|e| BusError::InvalidSubscription {
            reason: format!("malformed filters: {e}"),
        })
    }

    /// Later values win; unset fields keep the existing value.
    fn merge(&mut self, newer: SubscriptionFilters) {
        if newer.topic.is_some() {
            self.topic = newer.topic;
        }
        if newer.sender.is_some() {
            self.sender = newer.sender;
        }
        if newer.min_confidence.is_some() {
            self.min_confidence = newer.min_confidence;
        }
        if !newer.required_content_keys.is_empty() {
            self.required_content_keys = newer.required_content_keys;
        }
        self.extra.extend(newer.extra);
    }

    fn validate(&self) -> Result<(), BusError> {
        if let Some(min) = self.min_confidence {
            if !min.is_finite() {
                return Err(BusError::InvalidSubscription {
                    reason: "min_confidence must be a finite number".into(),
                });
            }
        }
        Ok(())
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(topic) = &self.topic {
            if message.topic() != Some(topic.as_str()) {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }

        if let Some(min) = self.min_confidence {
            match message.confidence {
                Some(confidence) if confidence >= min => {}
                _ => return false,
            }
        }

        if !self.required_content_keys.is_empty() {
            let present = if message.is_chunk() {
                fragment_content_keys(message)
            } else {
                message
                    .content
                    .as_object()
                    .map(|object| object.keys().map(String::as_str).collect())
            };
            let Some(present) = present else {
                return false;
            };
            if !self
                .required_content_keys
                .iter()
                .all(|key| present.contains(&key.as_str()))
            {
                return false;
            }
        }

        true
    }
}

/// Keys a fragment's original content had; `None` when it was not an object.
fn fragment_content_keys(message: &Message) -> Option<Vec<&str>> {
    message
        .metadata
        .get(ORIGINAL_KEYS_KEY)?
        .as_array()?
        .iter()
        .map(Value::as_str)
        .collect()
}

/// Per-subscription delivery options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    pub priority: Priority,
    pub filters: SubscriptionFilters,
    /// `None` runs the handler synchronously on the publisher's thread.
    pub timeout: Option<Duration>,
    /// Delivery attempts per message. `None` uses the registry default.
    pub max_retries: Option<u32>,
}

impl SubscribeOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filters(mut self, filters: SubscriptionFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// One agent's registration.
#[derive(Clone)]
pub struct Subscription {
    pub agent_id: String,
    pub types: BTreeSet<MessageType>,
    pub handler: Arc<dyn MessageHandler>,
    pub priority: Priority,
    pub filters: SubscriptionFilters,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    seq: u64,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("agent_id", &self.agent_id)
            .field("types", &self.types)
            .field("priority", &self.priority)
            .field("filters", &self.filters)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn covers_all_types(&self) -> bool {
        self.types.len() == MessageType::ALL.len()
    }

    /// Chunk fragments are also routed to subscribers of their original type.
    pub fn covers(&self, message: &Message) -> bool {
        if self.types.contains(&message.message_type) {
            return true;
        }
        message.is_chunk()
            && message
                .metadata
                .get(ORIGINAL_TYPE_KEY)
                .and_then(Value::as_str)
                .and_then(MessageType::parse)
                .is_some_and(|original| self.types.contains(&original))
    }

    fn addressed_to(&self, message: &Message) -> bool {
        match &message.receiver {
            Some(receiver) => &self.agent_id == receiver,
            None => self.agent_id != message.sender,
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.covers(message) && self.addressed_to(message) && self.filters.matches(message)
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub struct SubscriptionRegistry {
    subscriptions: HashMap<String, Subscription>,
    next_seq: u64,
    default_max_retries: u32,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::with_default_max_retries(DEFAULT_MAX_RETRIES)
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_max_retries(default_max_retries: u32) -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_seq: 0,
            default_max_retries,
        }
    }

    /// Register or merge. Returns `true` when the agent was not subscribed before.
    pub fn subscribe(
        &mut self,
        agent_id: &str,
        selection: TypeSelection,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<bool, BusError> {
        if agent_id.trim().is_empty() {
            return Err(BusError::InvalidSubscription {
                reason: "agent_id must not be empty".into(),
            });
        }
        options.filters.validate()?;

        let types = selection.expand();
        let max_retries = options.max_retries.unwrap_or(self.default_max_retries);
        if let Some(existing) = self.subscriptions.get_mut(agent_id) {
            existing.types.extend(types);
            existing.handler = handler;
            existing.priority = options.priority;
            existing.timeout = options.timeout;
            existing.max_retries = max_retries;
            existing.filters.merge(options.filters);
            return Ok(false);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.subscriptions.insert(
            agent_id.to_string(),
            Subscription {
                agent_id: agent_id.to_string(),
                types,
                handler,
                priority: options.priority,
                filters: options.filters,
                timeout: options.timeout,
                max_retries,
                seq,
            },
        );
        Ok(true)
    }

    /// Remove types. Returns `true` when the subscription is gone entirely.
    pub fn unsubscribe(&mut self, agent_id: &str, selection: &TypeSelection) -> bool {
        let Some(existing) = self.subscriptions.get_mut(agent_id) else {
            return false;
        };

        match selection {
            TypeSelection::All => existing.types.clear(),
            TypeSelection::Only(types) => {
                for ty in types {
                    existing.types.remove(ty);
                }
            }
        }

        if existing.types.is_empty() {
            self.subscriptions.remove(agent_id);
            true
        } else {
            false
        }
    }

    /// Matching subscriptions, priority descending then insertion order.
    pub fn resolve(&self, message: &Message) -> Vec<Subscription> {
        let mut matches: Vec<Subscription> = self
            .subscriptions
            .values()
            .filter(|sub| sub.matches(message))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        matches
    }

    pub fn get(&self, agent_id: &str) -> Option<&Subscription> {
        self.subscriptions.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.subscriptions.contains_key(agent_id)
    }

    /// Subscribed agents in insertion order.
    pub fn agents(&self) -> Vec<String> {
        let mut subs: Vec<&Subscription> = self.subscriptions.values().collect();
        subs.sort_by_key(|sub| sub.seq);
        subs.into_iter().map(|sub| sub.agent_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler::handler_fn;
    use serde_json::json;

    fn noop() -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(|_| Ok(())))
    }

    fn subscribe(
        reg: &mut SubscriptionRegistry,
        agent: &str,
        selection: TypeSelection,
        options: SubscribeOptions,
    ) {
        reg.subscribe(agent, selection, noop(), options).unwrap();
    }

    #[test]
    fn empty_agent_id_is_rejected() {
        let mut reg = SubscriptionRegistry::new();
        let err = reg
            .subscribe(" ", TypeSelection::All, noop(), SubscribeOptions::default())
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidSubscription { .. }));
    }

    #[test]
    fn resubscribe_merges_types_and_replaces_options() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "a", MessageType::Diagnosis.into(), SubscribeOptions::default());
        subscribe(
            &mut reg,
            "a",
            MessageType::FixProposal.into(),
            SubscribeOptions::default()
                .with_priority(Priority::High)
                .with_max_retries(7),
        );

        let sub = reg.get("a").unwrap();
        assert_eq!(reg.len(), 1);
        assert!(sub.types.contains(&MessageType::Diagnosis));
        assert!(sub.types.contains(&MessageType::FixProposal));
        assert_eq!(sub.priority, Priority::High);
        assert_eq!(sub.max_retries, 7);
    }

    #[test]
    fn unset_max_retries_uses_registry_default() {
        let mut reg = SubscriptionRegistry::with_default_max_retries(5);
        subscribe(&mut reg, "a", TypeSelection::All, SubscribeOptions::default());
        assert_eq!(reg.get("a").unwrap().max_retries, 5);
        assert_eq!(SubscriptionRegistry::new().default_max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn resubscribe_merges_filters() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(
            &mut reg,
            "a",
            TypeSelection::All,
            SubscribeOptions::default().with_filters(SubscriptionFilters::default().with_topic("t")),
        );
        subscribe(
            &mut reg,
            "a",
            TypeSelection::All,
            SubscribeOptions::default()
                .with_filters(SubscriptionFilters::default().with_sender("s")),
        );

        let filters = &reg.get("a").unwrap().filters;
        assert_eq!(filters.topic.as_deref(), Some("t"));
        assert_eq!(filters.sender.as_deref(), Some("s"));
    }

    #[test]
    fn all_stays_all_after_restricted_subscribe() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "a", TypeSelection::All, SubscribeOptions::default());
        subscribe(&mut reg, "a", MessageType::Query.into(), SubscribeOptions::default());
        assert!(reg.get("a").unwrap().covers_all_types());
    }

    #[test]
    fn unsubscribe_from_all_leaves_complement() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "a", TypeSelection::All, SubscribeOptions::default());
        assert!(!reg.unsubscribe("a", &TypeSelection::one(MessageType::Query)));

        let sub = reg.get("a").unwrap();
        assert!(!sub.types.contains(&MessageType::Query));
        assert_eq!(sub.types.len(), MessageType::ALL.len() - 1);
    }

    #[test]
    fn unsubscribing_last_type_removes_subscription() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "a", MessageType::Query.into(), SubscribeOptions::default());
        assert!(reg.unsubscribe("a", &TypeSelection::one(MessageType::Query)));
        assert!(!reg.contains("a"));
        assert!(!reg.unsubscribe("a", &TypeSelection::All));
    }

    #[test]
    fn broadcast_excludes_sender_and_orders_by_priority_then_insertion() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "sender", TypeSelection::All, SubscribeOptions::default());
        subscribe(&mut reg, "low", TypeSelection::All, SubscribeOptions::default().with_priority(Priority::Low));
        subscribe(&mut reg, "n1", TypeSelection::All, SubscribeOptions::default());
        subscribe(&mut reg, "crit", TypeSelection::All, SubscribeOptions::default().with_priority(Priority::Critical));
        subscribe(&mut reg, "n2", TypeSelection::All, SubscribeOptions::default());

        let msg = Message::new(MessageType::StatusUpdate, "sender", json!({}));
        let order: Vec<String> = reg.resolve(&msg).into_iter().map(|s| s.agent_id).collect();
        assert_eq!(order, vec!["crit", "n1", "n2", "low"]);
    }

    #[test]
    fn direct_resolves_only_receiver() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "a", TypeSelection::All, SubscribeOptions::default());
        subscribe(&mut reg, "b", TypeSelection::All, SubscribeOptions::default());

        let msg = Message::direct(MessageType::Query, "a", "b", json!({}));
        let matches = reg.resolve(&msg);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].agent_id, "b");
    }

    #[test]
    fn type_mismatch_does_not_match() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "a", MessageType::Diagnosis.into(), SubscribeOptions::default());
        let msg = Message::new(MessageType::Query, "x", json!({}));
        assert!(reg.resolve(&msg).is_empty());
    }

    #[test]
    fn filters_check_topic_sender_confidence_and_keys() {
        let filters = SubscriptionFilters::default()
            .with_topic("parser")
            .with_sender("triage")
            .with_min_confidence(0.5)
            .with_required_keys(["file", "line"]);

        let good = Message::new(MessageType::BugReport, "triage", json!({"file": "a.rs", "line": 3}))
            .with_topic("parser")
            .with_confidence(0.8);
        assert!(filters.matches(&good));

        assert!(!filters.matches(&good.clone().with_topic("lexer")));
        assert!(!filters.matches(&good.clone().with_confidence(0.2)));

        let mut no_confidence = good.clone();
        no_confidence.confidence = None;
        assert!(!filters.matches(&no_confidence));

        let mut missing_key = good.clone();
        missing_key.content = json!({"file": "a.rs"});
        assert!(!filters.matches(&missing_key));

        let mut other_sender = good;
        other_sender.sender = "fixer".into();
        assert!(!filters.matches(&other_sender));
    }

    #[test]
    fn unknown_filter_keys_are_ignored() {
        let filters =
            SubscriptionFilters::from_json(json!({"topic": "t", "shard": 4, "colour": "blue"}))
                .unwrap();
        assert_eq!(filters.extra.len(), 2);

        let msg = Message::new(MessageType::Query, "x", json!({})).with_topic("t");
        assert!(filters.matches(&msg));
    }

    #[test]
    fn non_finite_min_confidence_is_rejected() {
        let mut reg = SubscriptionRegistry::new();
        let options = SubscribeOptions::default()
            .with_filters(SubscriptionFilters::default().with_min_confidence(f64::NAN));
        assert!(reg.subscribe("a", TypeSelection::All, noop(), options).is_err());
    }

    #[test]
    fn chunk_matches_subscribers_of_original_type() {
        let mut reg = SubscriptionRegistry::new();
        subscribe(&mut reg, "diag", MessageType::Diagnosis.into(), SubscribeOptions::default());
        subscribe(&mut reg, "query", MessageType::Query.into(), SubscribeOptions::default());

        let chunk = Message::new(MessageType::Chunk, "x", json!("slice"))
            .with_metadata(ORIGINAL_TYPE_KEY, "diagnosis");
        let matched: Vec<String> = reg.resolve(&chunk).into_iter().map(|s| s.agent_id).collect();
        assert_eq!(matched, vec!["diag"]);
    }

    #[test]
    fn required_keys_use_fragment_key_list() {
        let filters = SubscriptionFilters::default().with_required_keys(["file"]);
        let fragment = |keys: Value| {
            Message::new(MessageType::Chunk, "x", json!("slice"))
                .with_metadata(ORIGINAL_TYPE_KEY, "diagnosis")
                .with_metadata(ORIGINAL_KEYS_KEY, keys)
        };

        assert!(filters.matches(&fragment(json!(["file", "line"]))));
        assert!(!filters.matches(&fragment(json!(["line"]))));

        let unlisted = Message::new(MessageType::Chunk, "x", json!("slice"));
        assert!(!filters.matches(&unlisted));
    }

    #[test]
    fn agents_listed_in_insertion_order() {
        let mut reg = SubscriptionRegistry::new();
        for agent in ["c", "a", "b"] {
            subscribe(&mut reg, agent, TypeSelection::All, SubscribeOptions::default());
        }
        assert_eq!(reg.agents(), vec!["c", "a", "b"]);
    }
}
