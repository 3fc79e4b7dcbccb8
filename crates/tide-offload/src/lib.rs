//! # tide-offload
//!
//! Drains the cache to durable storage and fills cache misses from it.
//!
//! ```text
//!              write-completion / flush / drain / recovery
//!                              │
//!  read miss ──► Download ─┐   ▼
//!                          ├─► TransferQueue ──► worker pool ──► BlockStore
//!  sequential ─► Prefetch ─┘   (Download > Upload > Prefetch)        │
//!                                                                   ▼
//!                                       per-hash lock ──► DedupIndex
//! ```
//!
//! An upload hashes the block, and under the lock for that hash either binds
//! the block to an existing record (no physical write) or writes the content
//! to its content-addressed location and binds it. Concurrent uploads of
//! identical content therefore produce exactly one physical write.

mod locks;
mod offloader;
pub mod queue;
pub mod retry;

pub use locks::HashLocks;
pub use offloader::{
    FlushResult, GcReport, OffloadStats, Offloader, ReconcileReport, UploadOutcome,
};
pub use queue::{QueueDepths, Transfer, TransferKind, TransferQueue};
pub use retry::RetryPolicy;

use std::sync::Arc;

use thiserror::Error;
use tide_cache::CacheError;
use tide_dedup::DedupError;
use tide_store::StoreError;

/// Offloader errors
#[derive(Error, Debug)]
pub enum OffloadError {
    #[error("block store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("dedup index error: {0}")]
    Index(#[from] DedupError),

    /// A binding points at durable content that is not there.
    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("{0} queue is full")]
    QueueFull(TransferKind),

    #[error("offloader is shut down")]
    ShutDown,

    #[error("operation cancelled")]
    Cancelled,

    /// Failure of a transfer shared by several waiters.
    #[error(transparent)]
    Shared(Arc<OffloadError>),
}

impl OffloadError {
    /// Whether the caller may succeed by trying again later.
    pub fn is_transient(&self) -> bool {
        match self {
            OffloadError::Store(e) => e.is_retryable(),
            OffloadError::Cache(e) => e.is_cache_full(),
            OffloadError::QueueFull(_) => true,
            OffloadError::Shared(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            OffloadError::Cancelled => true,
            OffloadError::Store(StoreError::Cancelled) => true,
            OffloadError::Cache(CacheError::Cancelled) => true,
            OffloadError::Shared(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OffloadError>;
