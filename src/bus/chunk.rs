//! Chunked transport for oversized messages.
//!
//! A message whose JSON wire form exceeds `max_message_size` is cut into
//! `Chunk` messages of at most `max_chunk_size` bytes each. Above
//! `compression_threshold` the wire form is gzip-compressed and base64-encoded
//! first. Every fragment carries the group id, its index, the group size and
//! the original message id, so the receiver can rebuild the original with
//! [`ChunkCodec::reassemble`] or incrementally with [`ChunkAssembler`].

use super::handler::MessageHandler;
use super::message::{ChunkHeader, Message, MessageType};
use super::subscription::{ORIGINAL_KEYS_KEY, ORIGINAL_TYPE_KEY};
use crate::util::{floor_utf8_char_boundary, next_utf8_char_boundary, unix_timestamp_secs};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

const ORIGINAL_ID_KEY: &str = "original_message_id";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("no chunks supplied")]
    NoChunks,
    #[error("incomplete chunk set: received {received} of {expected}")]
    Incomplete { received: usize, expected: usize },
    #[error("malformed chunk sequence: {reason}")]
    Malformed { reason: String },
    #[error("failed to encode message for chunking: {0}")]
    Encode(String),
    #[error("failed to decode reassembled message: {0}")]
    Decode(String),
}

impl ChunkError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }

    /// An incomplete set is not a failure; more fragments may still arrive.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }
}

/// The three size thresholds are independent of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    /// Wire size above which a message is split.
    pub max_message_size: usize,
    /// Wire size above which the split stream is gzip+base64 encoded.
    pub compression_threshold: usize,
    /// Upper bound on the bytes carried by one fragment.
    pub max_chunk_size: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkCodec {
    settings: ChunkSettings,
}

impl ChunkCodec {
    pub fn new(mut settings: ChunkSettings) -> Self {
        settings.max_chunk_size = settings.max_chunk_size.max(1);
        Self { settings }
    }

    pub fn settings(&self) -> ChunkSettings {
        self.settings
    }

    /// Split only when the wire form exceeds `max_message_size`.
    pub fn split_if_oversized(&self, message: &Message) -> Result<Option<Vec<Message>>, ChunkError> {
        let wire = message
            .to_wire()
            .map_err(|e| ChunkError::Encode(e.to_string()))?;
        if wire.len() <= self.settings.max_message_size {
            return Ok(None);
        }
        self.split_wire(message, wire).map(Some)
    }

    /// Split unconditionally. A message that fits yields a single fragment.
    pub fn split(&self, message: &Message) -> Result<Vec<Message>, ChunkError> {
        let wire = message
            .to_wire()
            .map_err(|e| ChunkError::Encode(e.to_string()))?;
        self.split_wire(message, wire)
    }

    fn split_wire(&self, message: &Message, wire: Vec<u8>) -> Result<Vec<Message>, ChunkError> {
        let compressed = wire.len() > self.settings.compression_threshold;
        let stream = if compressed {
            BASE64.encode(gzip(&wire)?)
        } else {
            String::from_utf8(wire).map_err(|e| ChunkError::Encode(e.to_string()))?
        };

        let fragments = slice_on_char_boundaries(&stream, self.settings.max_chunk_size);
        let group_id = Uuid::new_v4().to_string();
        let total = fragments.len();

        let mut metadata = HashMap::new();
        metadata.insert(
            ORIGINAL_TYPE_KEY.to_string(),
            Value::String(message.message_type.as_str().to_string()),
        );
        metadata.insert(ORIGINAL_ID_KEY.to_string(), Value::String(message.id.clone()));
        if let Some(object) = message.content.as_object() {
            let keys = object.keys().cloned().map(Value::String).collect();
            metadata.insert(ORIGINAL_KEYS_KEY.to_string(), Value::Array(keys));
        }
        if let Some(topic) = message.topic() {
            metadata.insert("topic".to_string(), Value::String(topic.to_string()));
        }

        let timestamp = unix_timestamp_secs();
        let chunks = fragments
            .into_iter()
            .enumerate()
            .map(|(index, fragment)| Message {
                id: Uuid::new_v4().to_string(),
                message_type: MessageType::Chunk,
                sender: message.sender.clone(),
                receiver: message.receiver.clone(),
                content: Value::String(fragment.to_string()),
                priority: message.priority,
                parent_id: message.parent_id.clone(),
                conversation_id: message.conversation_id.clone(),
                confidence: message.confidence,
                metadata: metadata.clone(),
                timestamp,
                chunk: Some(ChunkHeader {
                    is_chunked: true,
                    chunk_id: group_id.clone(),
                    total_chunks: total,
                    chunk_sequence: index,
                    response_id: message.id.clone(),
                    compressed,
                }),
            })
            .collect();

        Ok(chunks)
    }

    /// Rebuild the original message, distinguishing incomplete from malformed sets.
    pub fn try_reassemble(&self, chunks: &[Message]) -> Result<Message, ChunkError> {
        let first = chunks.first().ok_or(ChunkError::NoChunks)?;
        let first_header = header_of(first)?;
        let group_id = first_header.chunk_id.as_str();
        let expected = first_header.total_chunks;
        let compressed = first_header.compressed;

        let mut seen = HashSet::with_capacity(chunks.len());
        let mut ordered: Vec<(usize, &str)> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let header = header_of(chunk)?;
            if header.chunk_id != group_id {
                return Err(ChunkError::malformed(format!(
                    "mixed chunk groups `{group_id}` and `{}`",
                    header.chunk_id
                )));
            }
            if header.total_chunks != expected || header.compressed != compressed {
                return Err(ChunkError::malformed(format!(
                    "inconsistent headers in chunk group `{group_id}`"
                )));
            }
            if header.chunk_sequence >= expected {
                return Err(ChunkError::malformed(format!(
                    "sequence index {} out of range for {expected} chunks",
                    header.chunk_sequence
                )));
            }
            if !seen.insert(header.chunk_sequence) {
                return Err(ChunkError::malformed(format!(
                    "duplicate sequence index {}",
                    header.chunk_sequence
                )));
            }
            let fragment = chunk
                .content
                .as_str()
                .ok_or_else(|| ChunkError::malformed("chunk content is not a string fragment"))?;
            ordered.push((header.chunk_sequence, fragment));
        }

        if ordered.len() < expected {
            return Err(ChunkError::Incomplete {
                received: ordered.len(),
                expected,
            });
        }

        ordered.sort_unstable_by_key(|(index, _)| *index);
        let stream: String = ordered.into_iter().map(|(_, fragment)| fragment).collect();

        let wire = if compressed {
            let packed = BASE64
                .decode(stream.as_bytes())
                .map_err(|e| ChunkError::Decode(format!("base64: {e}")))?;
            gunzip(&packed)?
        } else {
            stream.into_bytes()
        };

        Message::from_wire(&wire).map_err(|e| ChunkError::Decode(e.to_string()))
    }

    /// Rebuild the original message, or `None` if the set is incomplete or malformed.
    pub fn reassemble(&self, chunks: &[Message]) -> Option<Message> {
        match self.try_reassemble(chunks) {
            Ok(message) => Some(message),
            Err(e) if e.is_incomplete() => {
                tracing::debug!(error = %e, "Chunk set not yet complete");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding chunk set");
                None
            }
        }
    }
}

fn header_of(message: &Message) -> Result<&ChunkHeader, ChunkError> {
    message
        .chunk
        .as_ref()
        .filter(|header| header.is_chunked)
        .ok_or_else(|| ChunkError::malformed(format!("message `{}` is not a chunk", message.id)))
}

/// Cut into slices of at most `max_bytes`, never splitting a UTF-8 character.
/// A character wider than `max_bytes` gets a slice of its own.
fn slice_on_char_boundaries(s: &str, max_bytes: usize) -> Vec<&str> {
    let mut slices = Vec::with_capacity(s.len() / max_bytes + 1);
    let mut start = 0;
    while start < s.len() {
        let mut end = floor_utf8_char_boundary(s, start.saturating_add(max_bytes));
        if end <= start {
            end = next_utf8_char_boundary(s, start);
        }
        slices.push(&s[start..end]);
        start = end;
    }
    if slices.is_empty() {
        slices.push("");
    }
    slices
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| ChunkError::Encode(format!("gzip: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ChunkError::Encode(format!("gzip: {e}")))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, ChunkError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| ChunkError::Decode(format!("gzip: {e}")))?;
    Ok(out)
}

struct PartialGroup {
    total: usize,
    fragments: BTreeMap<usize, Message>,
    started: Instant,
}

/// Receive-side buffer that collects fragments one at a time.
///
/// Groups are keyed by chunk group id and may be fed concurrently.
pub struct ChunkAssembler {
    codec: ChunkCodec,
    groups: DashMap<String, PartialGroup>,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(ChunkCodec::default())
    }
}

impl ChunkAssembler {
    pub fn new(codec: ChunkCodec) -> Self {
        Self {
            codec,
            groups: DashMap::new(),
        }
    }

    /// Buffer one fragment. Returns the original message once its group is complete.
    ///
    /// Repeated indices are ignored. A fragment that contradicts its group's
    /// declared size drops the whole group.
    pub fn accept(&self, chunk: Message) -> Result<Option<Message>, ChunkError> {
        let header = header_of(&chunk)?.clone();
        if header.chunk_sequence >= header.total_chunks {
            return Err(ChunkError::malformed(format!(
                "sequence index {} out of range for {} chunks",
                header.chunk_sequence, header.total_chunks
            )));
        }

        let complete = {
            let mut group = self
                .groups
                .entry(header.chunk_id.clone())
                .or_insert_with(|| PartialGroup {
                    total: header.total_chunks,
                    fragments: BTreeMap::new(),
                    started: Instant::now(),
                });
            if group.total != header.total_chunks {
                drop(group);
                self.groups.remove(&header.chunk_id);
                return Err(ChunkError::malformed(format!(
                    "chunk group `{}` changed its declared size",
                    header.chunk_id
                )));
            }
            group.fragments.entry(header.chunk_sequence).or_insert(chunk);
            group.fragments.len() == group.total
        };

        if !complete {
            return Ok(None);
        }

        // Another caller may have completed the same group first.
        let Some((_, group)) = self.groups.remove(&header.chunk_id) else {
            return Ok(None);
        };
        let chunks: Vec<Message> = group.fragments.into_values().collect();
        self.codec.try_reassemble(&chunks).map(Some)
    }

    /// Number of groups still waiting for fragments.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    /// Drop partial groups older than `max_age`. Returns how many were dropped.
    pub fn discard_stale(&self, max_age: Duration) -> usize {
        let before = self.groups.len();
        self.groups
            .retain(|_, group| group.started.elapsed() < max_age);
        before.saturating_sub(self.groups.len())
    }
}

/// Wraps a handler so it only ever sees whole messages.
///
/// Non-chunk messages pass straight through; fragments are buffered until
/// their group completes. A rebuilt message stays cached under its group id
/// until the inner handler accepts it, so a retried final fragment replays
/// the whole message instead of starting a new group.
pub struct ReassemblingHandler<H> {
    inner: H,
    assembler: ChunkAssembler,
    unconfirmed: DashMap<String, Message>,
}

impl<H: MessageHandler> ReassemblingHandler<H> {
    pub fn new(inner: H) -> Self {
        Self::with_codec(inner, ChunkCodec::default())
    }

    pub fn with_codec(inner: H, codec: ChunkCodec) -> Self {
        Self {
            inner,
            assembler: ChunkAssembler::new(codec),
            unconfirmed: DashMap::new(),
        }
    }

    pub fn pending_groups(&self) -> usize {
        self.assembler.pending_groups()
    }

    /// Rebuilt messages the inner handler has not accepted yet.
    pub fn unconfirmed_messages(&self) -> usize {
        self.unconfirmed.len()
    }

    fn hand_over(&self, group_id: &str, original: &Message) -> anyhow::Result<()> {
        self.inner.handle(original)?;
        self.unconfirmed.remove(group_id);
        Ok(())
    }
}

impl<H: MessageHandler> MessageHandler for ReassemblingHandler<H> {
    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        if !message.is_chunk() {
            return self.inner.handle(message);
        }
        let group_id = header_of(message)?.chunk_id.clone();

        let cached = self.unconfirmed.get(&group_id).map(|entry| entry.clone());
        if let Some(original) = cached {
            return self.hand_over(&group_id, &original);
        }

        match self.assembler.accept(message.clone())? {
            Some(original) => {
                // Cached before the call: a timed-out call may still be running when the retry lands.
                self.unconfirmed.insert(group_id.clone(), original.clone());
                self.hand_over(&group_id, &original)
            }
            None => Ok(()),
        }
    }
}
