//! # tide-content
//!
//! The content layer a protocol handler talks to. Every call goes to the
//! cache first; misses are filled through the offloader, durability requests
//! are handed to it.
//!
//! ```ignore
//! let service = ContentService::open(&Config::load()?)?;
//! let id = PayloadId::new("export", "inode-42");
//! service.write_at(&cancel, &id, 0, b"hello").await?;
//! service.flush(&cancel, &id, true).await?;
//! ```

mod service;

pub use service::{ContentService, StorageStats};
pub use tide_offload::FlushResult;

use thiserror::Error;
use tide_cache::CacheError;
use tide_config::ConfigError;
use tide_dedup::DedupError;
use tide_offload::OffloadError;
use tide_store::StoreError;

#[derive(Error, Debug)]
pub enum ContentError {
    /// No cached or durable representation exists for the payload.
    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Offload(#[from] OffloadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] DedupError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("content service is shut down")]
    Closed,
}

impl ContentError {
    /// Backpressure: the cache holds nothing it may evict.
    pub fn is_cache_full(&self) -> bool {
        match self {
            ContentError::Cache(e) => e.is_cache_full(),
            ContentError::Offload(OffloadError::Cache(e)) => e.is_cache_full(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        fn offload_not_found(e: &OffloadError) -> bool {
            match e {
                OffloadError::ContentNotFound(_) => true,
                OffloadError::Shared(inner) => offload_not_found(inner),
                _ => false,
            }
        }
        match self {
            ContentError::ContentNotFound(_) => true,
            ContentError::Offload(e) => offload_not_found(e),
            _ => false,
        }
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ContentError::Cache(e) => e.is_cache_full(),
            ContentError::Offload(e) => e.is_transient(),
            ContentError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContentError>;
