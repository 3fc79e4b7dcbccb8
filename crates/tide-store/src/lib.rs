//! # tide-store
//!
//! Durable block storage for Tidepool.
//!
//! A [`BlockStore`] is a flat key → bytes namespace. Blocks are written once
//! under a content-addressed key (see [`content_location`]) and never
//! modified in place; deleting one key can therefore never clobber content
//! some other logical block still points at.
//!
//! Two backends ship with the crate:
//! - [`MemoryBlockStore`]: tests and ephemeral shares
//! - [`FsBlockStore`]: local directory tree, atomic temp-file + rename writes

mod fs;
mod key;
mod layout;
mod memory;

pub use fs::FsBlockStore;
pub use key::{
    blocks_prefix, content_location, parse_content_location, BlockHash, BlockKey, PayloadId,
    MAX_SEGMENT_LEN,
};
pub use layout::{BlockLayout, BlockSpan};
pub use memory::{MemoryBlockStore, MemoryStoreStats};

use std::future::Future;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during block store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block not found: {key}")]
    NotFound { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("permanent backend error: {0}")]
    Permanent(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Transient I/O is worth retrying; missing keys, bad keys, permanent
    /// backend conditions and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage addressed by string key.
///
/// Every call takes a cancellation token; a cancelled call returns
/// [`StoreError::Cancelled`] and leaves no partially visible block behind.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Backend name for logs and stats.
    fn name(&self) -> &str;

    async fn write_block(&self, cancel: &CancellationToken, key: &str, data: Bytes) -> Result<()>;

    async fn read_block(&self, cancel: &CancellationToken, key: &str) -> Result<Bytes>;

    /// Read `length` bytes starting at `offset`. Reads past the end of the
    /// block are short; only the requested range is transferred.
    async fn read_block_range(
        &self,
        cancel: &CancellationToken,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes>;

    /// Missing keys yield [`StoreError::NotFound`].
    async fn delete_block(&self, cancel: &CancellationToken, key: &str) -> Result<()>;

    /// Returns the number of keys removed.
    async fn delete_by_prefix(&self, cancel: &CancellationToken, prefix: &str) -> Result<usize>;

    /// Keys starting with `prefix`, sorted.
    async fn list_by_prefix(&self, cancel: &CancellationToken, prefix: &str)
        -> Result<Vec<String>>;

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()>;
}

pub type SharedBlockStore = Arc<dyn BlockStore>;

/// Race `fut` against `cancel`; cancellation wins ties.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}
