//! Bounded, time-expiring cache of processed message ids.
//!
//! Lives inside the bus state, so it is mutated under the bus lock and needs
//! no synchronization of its own. Cleanup strategies:
//! - Lazy removal on `is_duplicate()` if expired
//! - Opportunistic purge of expired entries before eviction
//! - Oldest-first eviction when capacity is reached

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    first_seen: Instant,
    /// Insertion counter; breaks ties between equal instants on eviction.
    seq: u64,
}

#[derive(Debug)]
pub struct MessageDeduplicator {
    seen: HashMap<String, SeenEntry>,
    capacity: usize,
    ttl: Duration,
    next_seq: u64,
    evictions: u64,
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY, DEFAULT_DEDUP_TTL)
    }
}

impl MessageDeduplicator {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
            next_seq: 0,
            evictions: 0,
        }
    }

    /// True if `id` was processed within the retention window.
    pub fn is_duplicate(&mut self, id: &str) -> bool {
        self.is_duplicate_at(id, Instant::now())
    }

    pub fn is_duplicate_at(&mut self, id: &str, now: Instant) -> bool {
        match self.seen.get(id) {
            Some(entry) if now.duration_since(entry.first_seen) >= self.ttl => {
                self.seen.remove(id);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Insert or refresh `id`.
    pub fn mark_processed(&mut self, id: &str) {
        self.mark_processed_at(id, Instant::now());
    }

    pub fn mark_processed_at(&mut self, id: &str, now: Instant) {
        if !self.seen.contains_key(id) && self.seen.len() >= self.capacity {
            let ttl = self.ttl;
            self.seen
                .retain(|_, entry| now.duration_since(entry.first_seen) < ttl);

            if self.seen.len() >= self.capacity {
                if let Some(oldest) = self
                    .seen
                    .iter()
                    .min_by_key(|(_, entry)| (entry.first_seen, entry.seq))
                    .map(|(key, _)| key.clone())
                {
                    self.seen.remove(&oldest);
                    self.evictions += 1;
                }
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seen.insert(
            id.to_string(),
            SeenEntry {
                first_seen: now,
                seq,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live entries dropped to make room.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.evictions = 0;
    }
}
