//! Collaborator interfaces the bus forwards published messages to.
//!
//! The bus only ever appends; how a store persists or indexes conversations
//! is up to the implementation. Forwarding is best-effort: an `Err` is logged
//! and never affects delivery.

use crate::bus::Message;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

/// Conversation id used for messages that do not carry one.
pub const DEFAULT_CONVERSATION: &str = "default";

/// Append-only log of published messages, ordered per conversation.
pub trait ConversationStore: Send + Sync {
    fn append(&self, message: &Message) -> anyhow::Result<()>;
}

/// Receives one reasoning-trace entry per published message.
pub trait ThoughtChainSink: Send + Sync {
    fn record_thought(&self, agent_id: &str, thought: Value) -> anyhow::Result<()>;
}

/// Process-local conversation log.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of one conversation in append order.
    pub fn conversation(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conversations.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.conversations.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn append(&self, message: &Message) -> anyhow::Result<()> {
        let key = message
            .conversation_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
        self.conversations
            .lock()
            .entry(key)
            .or_default()
            .push(message.clone());
        Ok(())
    }
}

/// The entry a [`ThoughtChainSink`] receives for `message`.
pub(crate) fn thought_for(message: &Message) -> Value {
    serde_json::json!({
        "message_id": message.id,
        "message_type": message.message_type,
        "receiver": message.receiver,
        "conversation_id": message.conversation_id,
        "parent_id": message.parent_id,
        "priority": message.priority,
        "confidence": message.confidence,
        "timestamp": message.timestamp,
        "metadata": message.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageType;
    use serde_json::json;

    #[test]
    fn appends_are_grouped_by_conversation_in_order() {
        let store = InMemoryConversationStore::new();
        let a1 = Message::new(MessageType::BugReport, "triage", json!({"n": 1})).with_conversation("c1");
        let b1 = Message::new(MessageType::Query, "triage", json!({"n": 2})).with_conversation("c2");
        let a2 = Message::new(MessageType::Diagnosis, "diag", json!({"n": 3})).with_conversation("c1");
        for msg in [&a1, &b1, &a2] {
            store.append(msg).unwrap();
        }

        let c1 = store.conversation("c1");
        assert_eq!(c1.len(), 2);
        assert_eq!(c1[0].id, a1.id);
        assert_eq!(c1[1].id, a2.id);
        assert_eq!(store.conversation_ids(), vec!["c1", "c2"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn messages_without_conversation_go_to_default() {
        let store = InMemoryConversationStore::new();
        store
            .append(&Message::new(MessageType::StatusUpdate, "a", json!(null)))
            .unwrap();
        assert_eq!(store.conversation(DEFAULT_CONVERSATION).len(), 1);
    }

    #[test]
    fn thought_carries_routing_metadata() {
        let msg = Message::direct(MessageType::FixProposal, "fixer", "verifier", json!({}))
            .with_confidence(0.75)
            .with_topic("parser");
        let thought = thought_for(&msg);
        assert_eq!(thought["message_id"], json!(msg.id));
        assert_eq!(thought["message_type"], json!("fix_proposal"));
        assert_eq!(thought["receiver"], json!("verifier"));
        assert_eq!(thought["confidence"], json!(0.75));
        assert_eq!(thought["metadata"]["topic"], json!("parser"));
    }
}
