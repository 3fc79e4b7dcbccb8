//! # tide-cache
//!
//! Block-granular, crash-safe content cache.
//!
//! Every write is split into block buffers and appended to the write-ahead
//! log before it is acknowledged. Buffers move through
//! `Pending → Uploading → Uploaded` as the offloader drains them; only
//! `Uploaded` buffers are eviction candidates.
//!
//! ## Locking
//!
//! ```text
//! entries: DashMap<PayloadId, Arc<Mutex<CacheEntry>>>   (lookup/insert/remove only)
//!                                  │
//!                 entry mutex ─► LRU mutex ─► WAL mutex
//! ```
//!
//! An entry mutex is never acquired while a map reference is held. Eviction
//! of another payload's buffers uses `try_lock`, so a writer never waits on
//! an unrelated entry.

mod cache;
mod coverage;
mod lru;
pub mod wal;

pub use cache::{
    BlockState, Cache, CacheGap, CacheRead, CacheStats, CommitOutcome, TruncateBase,
    UploadSnapshot, WriteOutcome,
};
pub use coverage::Coverage;
pub use wal::{WalReport, WalUsage};

use thiserror::Error;

/// Cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// No `Uploaded` buffer could be evicted to make room.
    #[error("cache full: need {needed} bytes, {used}/{capacity} in use")]
    CacheFull {
        needed: u64,
        used: u64,
        capacity: u64,
    },

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("WAL full: {needed} bytes needed, limit {max}")]
    WalFull { needed: u64, max: u64 },

    #[error("WAL block size {wal} does not match configured block size {configured}")]
    LayoutMismatch { wal: u64, configured: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A dedup index callback failed while the entry lock was held.
    #[error("index update failed: {0}")]
    Index(Box<dyn std::error::Error + Send + Sync>),

    /// A truncate cuts through a block whose retained prefix is not cached.
    #[error("truncate needs the durable content of block {block}")]
    NeedsBase { block: u64 },

    #[error("cache is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn is_cache_full(&self) -> bool {
        matches!(self, CacheError::CacheFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
