//! Storage backends for the broker
//!
//! - Memory: per-channel ring buffers serving the history API

mod history;

pub use history::{MemoryHistoryStore, RingBuffer};

pub use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A publication as stored in a channel
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPublication {
    /// Position in the channel stream, starting at 1
    pub offset: u64,
    pub data: Value,
}

/// A read of channel history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySlice {
    /// Oldest first
    pub publications: Vec<StoredPublication>,
    /// Offset of the newest publication in the channel
    pub offset: u64,
    /// Identifies the stream generation the offsets belong to
    pub epoch: String,
}

/// Trait for channel history storage
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a publication and return it with its assigned offset
    async fn append(&self, channel: &str, data: Value) -> Result<StoredPublication, StorageError>;

    /// Read history oldest-first: `limit < 0` everything, `0` only the stream
    /// position, `n` the oldest `n` retained publications
    async fn history(&self, channel: &str, limit: i64) -> Result<HistorySlice, StorageError>;
}
