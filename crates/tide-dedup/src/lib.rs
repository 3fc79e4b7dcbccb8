//! # tide-dedup
//!
//! Deduplication index: content hash → physical block, plus the binding of
//! every logical block to the content it currently holds.
//!
//! Records are scoped per share. A record carries a reference count equal
//! to the number of logical blocks bound to it; binding, rebinding and
//! unbinding adjust counts in the same atomic step as the binding change.
//!
//! ```text
//! (share, hash) ──► DedupRecord { location, size, refs }
//! BlockKey      ──► BlockBinding { hash, location, size }
//! ```
//!
//! A record whose count reaches zero is an orphan. Its physical block stays
//! in place until garbage collection removes both under the per-hash lock.

mod lmdb;
mod memory;

pub use lmdb::LmdbDedupIndex;
pub use memory::MemoryDedupIndex;

use std::sync::Arc;

use thiserror::Error;
use tide_config::log_dedup_error;
use tide_store::{BlockHash, BlockKey, PayloadId};

/// Dedup index errors
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A reference count would go negative or a binding points at a missing record.
    #[error("dedup inconsistency: {0}")]
    Inconsistent(String),

    #[error("corrupted index entry: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, DedupError>;

/// Build an inconsistency error, logging it at error level.
pub(crate) fn inconsistent(msg: String) -> DedupError {
    log_dedup_error!(detail = %msg, "dedup inconsistency");
    DedupError::Inconsistent(msg)
}

/// One stored piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupRecord {
    pub share: String,
    pub hash: BlockHash,
    pub location: String,
    pub size: u64,
    pub refs: u64,
}

/// The content a logical block currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBinding {
    pub hash: BlockHash,
    pub location: String,
    pub size: u64,
}

/// A reference dropped by a rebind or unbind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub share: String,
    pub hash: BlockHash,
    /// References left on the record after the release
    pub remaining: u64,
}

impl Released {
    pub fn orphaned(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOutcome {
    /// The key was already bound to this hash; nothing changed.
    pub unchanged: bool,
    /// The record did not exist and was created.
    pub created: bool,
    /// Reference count on the bound record after the call
    pub refs: u64,
    /// Reference given up on the previously bound content
    pub released: Option<Released>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub records: u64,
    pub orphans: u64,
    pub bindings: u64,
    /// Bytes stored once per record
    pub physical_bytes: u64,
    /// Bytes as seen by logical blocks
    pub logical_bytes: u64,
}

impl DedupStats {
    /// Logical bytes per physical byte; 1.0 when nothing is stored.
    pub fn dedup_ratio(&self) -> f64 {
        if self.physical_bytes == 0 {
            1.0
        } else {
            self.logical_bytes as f64 / self.physical_bytes as f64
        }
    }
}

/// Content-hash index.
///
/// Every mutating call is atomic: either the binding change and all
/// reference count adjustments land together, or nothing changes.
pub trait DedupIndex: Send + Sync {
    fn lookup(&self, share: &str, hash: &BlockHash) -> Result<Option<DedupRecord>>;

    /// Bind `key` to content `hash` of `size` bytes.
    ///
    /// Creates the record with one reference or adds one to an existing
    /// record, and releases the reference held on any previous content of
    /// the key. Rebinding to the same hash changes nothing.
    fn bind(&self, key: &BlockKey, hash: &BlockHash, size: u64) -> Result<BindOutcome>;

    /// Drop the binding of `key`, if any.
    fn unbind(&self, key: &BlockKey) -> Result<Option<Released>>;

    /// Drop every binding of `payload` at or after `(chunk, block)`.
    fn unbind_from(&self, payload: &PayloadId, chunk: u64, block: u64) -> Result<Vec<Released>>;

    fn binding(&self, key: &BlockKey) -> Result<Option<BlockBinding>>;

    /// All bindings of `payload` in key order.
    fn bindings(&self, payload: &PayloadId) -> Result<Vec<(BlockKey, BlockBinding)>>;

    fn has_bindings(&self, payload: &PayloadId) -> Result<bool>;

    /// Records with no references left, across all shares.
    fn orphans(&self) -> Result<Vec<DedupRecord>>;

    /// Remove a record that still has zero references. Returns `false` when
    /// the record is gone or has been referenced again.
    fn remove_orphan(&self, share: &str, hash: &BlockHash) -> Result<bool>;

    fn records(&self, share: &str) -> Result<Vec<DedupRecord>>;

    /// Shares that own at least one record.
    fn shares(&self) -> Result<Vec<String>>;

    fn stats(&self) -> Result<DedupStats>;

    /// Persist outstanding state; a no-op for in-memory indexes.
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

pub type SharedDedupIndex = Arc<dyn DedupIndex>;

/// Drop every binding of a payload.
pub fn unbind_payload(index: &dyn DedupIndex, payload: &PayloadId) -> Result<Vec<Released>> {
    index.unbind_from(payload, 0, 0)
}
