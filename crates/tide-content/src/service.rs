use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tide_cache::{Cache, CacheGap, CacheRead, CacheStats};
use tide_config::{
    expand_home, log_content_debug, log_content_info, log_content_warn, Config, IndexBackend,
    OffloadSection, StoreBackend,
};
use tide_dedup::{DedupStats, LmdbDedupIndex, MemoryDedupIndex, SharedDedupIndex};
use tide_offload::{FlushResult, GcReport, OffloadStats, Offloader, ReconcileReport};
use tide_store::{BlockLayout, FsBlockStore, MemoryBlockStore, PayloadId, SharedBlockStore};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{ContentError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StorageStats {
    pub cache: CacheStats,
    pub dedup: DedupStats,
    pub offload: OffloadStats,
    /// Logical bytes per stored byte
    pub dedup_ratio: f64,
}

/// Cached, deduplicated block I/O over a pluggable block store.
///
/// One instance per process. Must be created inside a tokio runtime: the
/// offloader's worker pool starts with it.
pub struct ContentService {
    cache: Arc<Cache>,
    offloader: Arc<Offloader>,
    store: SharedBlockStore,
    index: SharedDedupIndex,
    layout: BlockLayout,
    cfg: OffloadSection,
    /// End offset of the last read per payload, for sequential detection
    read_ends: DashMap<PayloadId, u64>,
    closed: AtomicBool,
}

impl ContentService {
    /// Build the configured store and index backends, then start the service.
    pub fn open(cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let store: SharedBlockStore = match cfg.store.backend {
            StoreBackend::Memory => Arc::new(MemoryBlockStore::new()),
            StoreBackend::Fs => Arc::new(FsBlockStore::new(expand_home(&cfg.store.root))?),
        };
        let index: SharedDedupIndex = match cfg.index.backend {
            IndexBackend::Memory => Arc::new(MemoryDedupIndex::new()),
            IndexBackend::Lmdb => Arc::new(LmdbDedupIndex::open(expand_home(&cfg.index.path))?),
        };
        Self::with_backends(cfg, store, index)
    }

    /// Start over existing backends: replay the WAL, start the worker pool
    /// and queue every recovered block for upload.
    pub fn with_backends(
        cfg: &Config,
        store: SharedBlockStore,
        index: SharedDedupIndex,
    ) -> Result<Self> {
        cfg.validate()?;
        let layout = BlockLayout::from(&cfg.layout);
        let cache = Arc::new(Cache::open(layout, &cfg.cache)?);
        let offloader = Offloader::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&index),
            &cfg.offload,
        );
        let workers = cfg.worker_count();
        offloader.start(workers);
        let recovered = offloader.recover();

        log_content_info!(
            store = store.name(),
            block_size = layout.block_size,
            max_bytes = cfg.cache.max_bytes,
            workers,
            recovered,
            "Content service started"
        );
        Ok(Self {
            cache,
            offloader,
            store,
            index,
            layout,
            cfg: cfg.offload.clone(),
            read_ends: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ContentError::Closed);
        }
        Ok(())
    }

    fn check_payload(&self, payload: &PayloadId) -> Result<()> {
        self.check()?;
        payload.validate()?;
        Ok(())
    }

    /// Read `len` bytes at `offset`. Ranges nothing was ever written to read
    /// as zeros; the caller clamps to the file size it knows.
    #[instrument(skip(self, cancel), level = "debug", fields(payload = %payload))]
    pub async fn read_at(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        self.check_payload(payload)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let CacheRead {
            mut data,
            gaps,
            epoch,
            found,
        } = self.cache.read_at(cancel, payload, offset, len)?;

        if !gaps.is_empty() {
            if !found && !self.index.has_bindings(payload)? {
                return Err(ContentError::ContentNotFound(payload.to_string()));
            }
            self.fill_gaps(cancel, payload, &mut data, gaps, epoch, len)
                .await?;
        }

        self.note_read(payload, offset, len as u64, epoch);
        Ok(Bytes::from(data))
    }

    async fn fill_gaps(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        data: &mut [u8],
        gaps: Vec<CacheGap>,
        epoch: u64,
        len: usize,
    ) -> Result<()> {
        let mut by_block: BTreeMap<u64, Vec<CacheGap>> = BTreeMap::new();
        for gap in gaps {
            by_block.entry(gap.index).or_default().push(gap);
        }
        let stream = len as u64 >= self.cfg.stream_read_threshold;

        for (index, gaps) in by_block {
            // Large reads of blocks the cache holds nothing of bypass it
            if stream && gaps.iter().all(|g| !g.cached) {
                for gap in &gaps {
                    let range = self
                        .offloader
                        .read_range(cancel, payload, index, gap.offset, gap.len)
                        .await?;
                    if let Some(bytes) = range {
                        let n = bytes.len().min(gap.len as usize);
                        let at = gap.buf_offset as usize;
                        data[at..at + n].copy_from_slice(&bytes[..n]);
                    }
                }
                continue;
            }

            let Some(block) = self
                .offloader
                .fetch_block(cancel, payload, index, epoch)
                .await?
            else {
                continue;
            };
            for gap in &gaps {
                let start = gap.offset as usize;
                let end = ((gap.offset + gap.len) as usize).min(block.len());
                if start < end {
                    let at = gap.buf_offset as usize;
                    data[at..at + end - start].copy_from_slice(&block[start..end]);
                }
            }
        }
        Ok(())
    }

    fn note_read(&self, payload: &PayloadId, offset: u64, len: u64, epoch: u64) {
        let end = offset + len;
        let previous = self.read_ends.insert(payload.clone(), end);
        if previous == Some(offset) && self.cfg.prefetch_blocks > 0 {
            let last = self.layout.block_of(end - 1);
            let queued = self.offloader.prefetch(payload, last, epoch);
            if queued > 0 {
                log_content_debug!(payload = %payload, after = last, queued, "Sequential read; prefetching");
            }
        }
    }

    /// Write `data` at `offset`. Returns once the bytes are in the WAL.
    #[instrument(skip(self, cancel, data), level = "debug", fields(payload = %payload, len = data.len()))]
    pub async fn write_at(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        self.check_payload(payload)?;
        let outcome = self.cache.write_at(cancel, payload, offset, data)?;
        for block in outcome.completed {
            self.offloader.enqueue_upload(payload, block);
        }
        Ok(outcome.written)
    }

    /// Push the payload's dirty blocks towards the block store, waiting for
    /// them to become durable when `wait` is set.
    pub async fn flush(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        wait: bool,
    ) -> Result<FlushResult> {
        self.check_payload(payload)?;
        Ok(self.offloader.flush(cancel, payload, wait).await?)
    }

    pub async fn flush_all(&self, cancel: &CancellationToken, wait: bool) -> Result<FlushResult> {
        self.check()?;
        Ok(self.offloader.flush_all(cancel, wait).await?)
    }

    pub async fn truncate(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        size: u64,
    ) -> Result<()> {
        self.check_payload(payload)?;
        self.offloader.truncate_payload(cancel, payload, size).await?;
        self.read_ends.remove(payload);
        log_content_debug!(payload = %payload, size, "Truncated");
        Ok(())
    }

    pub async fn delete(&self, cancel: &CancellationToken, payload: &PayloadId) -> Result<()> {
        self.check_payload(payload)?;
        let released = self.offloader.delete_payload(cancel, payload)?;
        self.read_ends.remove(payload);
        log_content_debug!(payload = %payload, released, "Deleted");
        Ok(())
    }

    pub async fn storage_stats(&self, cancel: &CancellationToken) -> Result<StorageStats> {
        if cancel.is_cancelled() {
            return Err(ContentError::Offload(tide_offload::OffloadError::Cancelled));
        }
        let dedup = self.index.stats()?;
        Ok(StorageStats {
            cache: self.cache.stats(),
            dedup,
            offload: self.offloader.stats(),
            dedup_ratio: dedup.dedup_ratio(),
        })
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        self.check()?;
        self.store.health_check(cancel).await?;
        Ok(())
    }

    /// Reclaim storage of content nobody references any more.
    pub async fn collect_garbage(&self, cancel: &CancellationToken) -> Result<GcReport> {
        self.check()?;
        Ok(self.offloader.collect_garbage(cancel).await?)
    }

    /// Remove stored blocks with no index record and report records with no
    /// stored block. Run it before serving traffic.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        self.check()?;
        Ok(self.offloader.reconcile(cancel).await?)
    }

    /// Stop the worker pool, giving in-flight transfers up to `timeout`, then
    /// sync and close the WAL and the index. Dirty blocks stay in the WAL.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.offloader.shutdown(timeout).await;
        let dirty = self.cache.stats().dirty_bytes;
        self.cache.close()?;
        self.index.sync()?;
        if dirty > 0 {
            log_content_warn!(dirty_bytes = dirty, "Shut down with unflushed data; it will be replayed from the WAL");
        }
        log_content_info!("Content service stopped");
        Ok(())
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn offloader(&self) -> &Arc<Offloader> {
        &self.offloader
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }
}
