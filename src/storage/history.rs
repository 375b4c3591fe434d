//! In-memory channel history: one bounded ring buffer per channel

use crate::storage::{HistorySlice, HistoryStore, StorageError, StoredPublication};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Ring buffer holding the most recent publications of one channel
pub struct RingBuffer {
    /// Maximum number of publications to retain
    capacity: usize,
    inner: RwLock<RingState>,
}

struct RingState {
    entries: VecDeque<StoredPublication>,
    /// Offset of the newest publication (0 before the first)
    top_offset: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(RingState {
                entries: VecDeque::new(),
                top_offset: 0,
            }),
        }
    }

    /// Append a publication, evicting the oldest at capacity
    ///
    /// Offsets are assigned under the write lock, so buffer order and offset
    /// order always agree.
    pub fn push(&self, data: Value) -> StoredPublication {
        let mut state = self.inner.write();

        state.top_offset += 1;
        let publication = StoredPublication {
            offset: state.top_offset,
            data,
        };

        while state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(publication.clone());

        publication
    }

    /// Oldest-first slice: `limit < 0` everything, `0` nothing, `n` the oldest `n`
    pub fn read(&self, limit: i64) -> (Vec<StoredPublication>, u64) {
        let state = self.inner.read();

        let publications = match usize::try_from(limit) {
            Ok(n) => state.entries.iter().take(n).cloned().collect(),
            Err(_) => state.entries.iter().cloned().collect(),
        };

        (publications, state.top_offset)
    }

    /// Offset of the newest publication
    pub fn top_offset(&self) -> u64 {
        self.inner.read().top_offset
    }

    /// Oldest offset still retained
    pub fn oldest_offset(&self) -> Option<u64> {
        self.inner.read().entries.front().map(|p| p.offset)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

/// History store backed by per-channel ring buffers
///
/// Everything is lost on restart; the epoch changes with every new store so
/// clients can tell that offsets were reset.
pub struct MemoryHistoryStore {
    capacity: usize,
    epoch: String,
    channels: RwLock<HashMap<String, Arc<RingBuffer>>>,
}

impl MemoryHistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            epoch: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn buffer(&self, channel: &str) -> Arc<RingBuffer> {
        if let Some(buffer) = self.channels.read().get(channel) {
            return buffer.clone();
        }

        self.channels
            .write()
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(RingBuffer::new(self.capacity)))
            .clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, channel: &str, data: Value) -> Result<StoredPublication, StorageError> {
        Ok(self.buffer(channel).push(data))
    }

    async fn history(&self, channel: &str, limit: i64) -> Result<HistorySlice, StorageError> {
        let existing = self.channels.read().get(channel).cloned();

        let (publications, offset) = match existing {
            Some(buffer) => buffer.read(limit),
            None => (Vec::new(), 0),
        };

        Ok(HistorySlice {
            publications,
            offset,
            epoch: self.epoch.clone(),
        })
    }
}
