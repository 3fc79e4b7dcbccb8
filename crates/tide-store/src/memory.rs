//! In-memory block store for tests and ephemeral shares.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{BlockStore, Result, StoreError};

/// Operation counters, used by tests to assert physical I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub writes: u64,
    pub reads: u64,
    pub range_reads: u64,
    pub deletes: u64,
    pub bytes_read: u64,
}

#[derive(Default)]
pub struct MemoryBlockStore {
    map: RwLock<BTreeMap<String, Bytes>>,
    writes: AtomicU64,
    reads: AtomicU64,
    range_reads: AtomicU64,
    deletes: AtomicU64,
    bytes_read: AtomicU64,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            writes: self.writes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            range_reads: self.range_reads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.map.read().await.contains_key(key)
    }

    /// Sum of stored block sizes.
    pub async fn total_bytes(&self) -> u64 {
        self.map.read().await.values().map(|b| b.len() as u64).sum()
    }

    fn check(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_block(&self, cancel: &CancellationToken, key: &str, data: Bytes) -> Result<()> {
        Self::check(cancel)?;
        self.map.write().await.insert(key.to_string(), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_block(&self, cancel: &CancellationToken, key: &str) -> Result<Bytes> {
        Self::check(cancel)?;
        let data = self
            .map
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    async fn read_block_range(
        &self,
        cancel: &CancellationToken,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        Self::check(cancel)?;
        let guard = self.map.read().await;
        let data = guard.get(key).ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })?;
        let len = data.len() as u64;
        let start = offset.min(len);
        let end = offset.saturating_add(length).min(len);
        let slice = data.slice(start as usize..end as usize);
        self.range_reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(slice.len() as u64, Ordering::Relaxed);
        Ok(slice)
    }

    async fn delete_block(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        Self::check(cancel)?;
        match self.map.write().await.remove(key) {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete_by_prefix(&self, cancel: &CancellationToken, prefix: &str) -> Result<usize> {
        Self::check(cancel)?;
        let mut guard = self.map.write().await;
        let doomed: Vec<String> = guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            guard.remove(key);
        }
        self.deletes
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        Ok(doomed.len())
    }

    async fn list_by_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<String>> {
        Self::check(cancel)?;
        let guard = self.map.read().await;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        Self::check(cancel)
    }
}
