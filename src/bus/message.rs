use crate::util::unix_timestamp_secs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Closed set of message kinds exchanged between repair agents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    BugReport,
    Diagnosis,
    FixProposal,
    PatchApplied,
    TestResult,
    ReviewRequest,
    ReviewFeedback,
    Query,
    Response,
    StatusUpdate,
    Error,
    /// One fragment of an oversized message.
    Chunk,
}

impl MessageType {
    pub const ALL: [MessageType; 13] = [
        MessageType::TaskAssignment,
        MessageType::BugReport,
        MessageType::Diagnosis,
        MessageType::FixProposal,
        MessageType::PatchApplied,
        MessageType::TestResult,
        MessageType::ReviewRequest,
        MessageType::ReviewFeedback,
        MessageType::Query,
        MessageType::Response,
        MessageType::StatusUpdate,
        MessageType::Error,
        MessageType::Chunk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::BugReport => "bug_report",
            MessageType::Diagnosis => "diagnosis",
            MessageType::FixProposal => "fix_proposal",
            MessageType::PatchApplied => "patch_applied",
            MessageType::TestResult => "test_result",
            MessageType::ReviewRequest => "review_request",
            MessageType::ReviewFeedback => "review_feedback",
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::StatusUpdate => "status_update",
            MessageType::Error => "error",
            MessageType::Chunk => "chunk",
        }
    }

    /// Inverse of [`MessageType::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.as_str() == value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Wire header carried by chunk fragments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkHeader {
    pub is_chunked: bool,
    /// Group id shared by every fragment of one split.
    pub chunk_id: String,
    pub total_chunks: usize,
    /// Zero-based position of this fragment within its group.
    pub chunk_sequence: usize,
    /// Id of the message this fragment was cut from.
    pub response_id: String,
    pub compressed: bool,
}

/// A message routed by the bus.
///
/// Messages are treated as immutable once published: the bus takes ownership
/// and only ever clones them for delivery. A repeated `id` is a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "message_id")]
    pub id: String,
    pub message_type: MessageType,
    pub sender: String,
    /// `None` means broadcast.
    pub receiver: Option<String>,
    pub content: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(flatten)]
    pub chunk: Option<ChunkHeader>,
}

impl Message {
    /// Construct a broadcast message.
    pub fn new(message_type: MessageType, sender: impl Into<String>, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: sender.into(),
            receiver: None,
            content,
            priority: Priority::Normal,
            parent_id: None,
            conversation_id: None,
            confidence: None,
            metadata: HashMap::new(),
            timestamp: unix_timestamp_secs(),
            chunk: None,
        }
    }

    /// Construct a message addressed to exactly one agent.
    pub fn direct(
        message_type: MessageType,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        content: Value,
    ) -> Self {
        let mut message = Self::new(message_type, sender, content);
        message.receiver = Some(receiver.into());
        message
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Attach a confidence score, clamped into `[0.0, 1.0]`. NaN clears it.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = if confidence.is_nan() {
            None
        } else {
            Some(confidence.clamp(0.0, 1.0))
        };
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Shorthand for the `topic` metadata entry.
    pub fn with_topic(self, topic: impl Into<String>) -> Self {
        self.with_metadata("topic", topic.into())
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver.is_none()
    }

    pub fn is_chunk(&self) -> bool {
        self.message_type == MessageType::Chunk
    }

    pub fn topic(&self) -> Option<&str> {
        self.metadata.get("topic").and_then(Value::as_str)
    }

    /// Serialized JSON wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Size in bytes of the JSON wire form.
    pub fn wire_size(&self) -> Result<usize, serde_json::Error> {
        self.to_wire().map(|bytes| bytes.len())
    }
}
