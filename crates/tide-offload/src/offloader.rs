//! The offload engine: worker pool, transfers, flush, reclamation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tide_cache::{BlockState, Cache, CacheError, CommitOutcome, TruncateBase, UploadSnapshot};
use tide_config::{
    log_dedup_error, log_offload_debug, log_offload_error, log_offload_info, log_offload_warn,
    OffloadSection,
};
use tide_dedup::{unbind_payload, BindOutcome, DedupRecord, SharedDedupIndex};
use tide_store::{
    content_location, parse_content_location, BlockHash, BlockKey, BlockLayout, PayloadId,
    SharedBlockStore,
};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::locks::HashLocks;
use crate::queue::{QueueDepths, Rejected, Transfer, TransferKind, TransferQueue};
use crate::retry::RetryPolicy;
use crate::{OffloadError, Result};

/// Immediate re-uploads of a block written again mid-upload before it is
/// handed back to the queue.
const SUPERSEDED_RETRIES: usize = 4;

type BlockRef = (PayloadId, u64);
type SharedResult<T> = std::result::Result<T, Arc<OffloadError>>;
type DownloadKey = (PayloadId, u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The block is durable. `deduplicated` means no physical write was needed.
    Uploaded { deduplicated: bool },
    /// Bound, but written again meanwhile; still dirty.
    Superseded,
    /// Nothing to do: the block is clean or was dropped.
    Skipped,
    /// Another upload of the block is in flight.
    InFlight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Blocks handed to the worker pool
    pub enqueued: usize,
    /// Blocks uploaded by the calling task
    pub uploaded_inline: usize,
    /// No block of the payload was dirty when the call returned
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub reclaimed: u64,
    pub bytes: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Content-addressed blocks found in the store
    pub scanned: u64,
    /// Blocks deleted because no record references them
    pub removed: u64,
    /// Records whose block is missing from the store
    pub missing: Vec<DedupRecord>,
}

#[derive(Debug, Default)]
struct Counters {
    uploads: AtomicU64,
    dedup_hits: AtomicU64,
    bytes_uploaded: AtomicU64,
    downloads: AtomicU64,
    bytes_downloaded: AtomicU64,
    prefetches: AtomicU64,
    upload_failures: AtomicU64,
    download_failures: AtomicU64,
    retries: AtomicU64,
    rejected_uploads: AtomicU64,
    gc_reclaimed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffloadStats {
    pub uploads: u64,
    pub dedup_hits: u64,
    pub bytes_uploaded: u64,
    pub downloads: u64,
    pub bytes_downloaded: u64,
    pub prefetches: u64,
    pub upload_failures: u64,
    pub download_failures: u64,
    pub retries: u64,
    pub rejected_uploads: u64,
    pub gc_reclaimed: u64,
    pub queue: QueueDepths,
    pub in_flight: u64,
}

/// Returns an `Uploading` block to `Pending` when dropped. A no-op once the
/// upload committed or the block was written again.
struct UploadGuard<'a> {
    cache: &'a Cache,
    payload: &'a PayloadId,
    block: u64,
    snap: UploadSnapshot,
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        self.cache.abort_upload(self.payload, self.block, &self.snap);
    }
}

/// Background transfer engine between a [`Cache`] and a block store.
pub struct Offloader {
    cache: Arc<Cache>,
    store: SharedBlockStore,
    index: SharedDedupIndex,
    layout: BlockLayout,
    cfg: OffloadSection,
    retry: RetryPolicy,
    queue: TransferQueue,
    locks: HashLocks,
    upload_waiters: Mutex<HashMap<BlockRef, Vec<oneshot::Sender<SharedResult<()>>>>>,
    downloads: Mutex<HashMap<DownloadKey, Vec<oneshot::Sender<SharedResult<Option<Bytes>>>>>>,
    counters: Counters,
    in_flight: AtomicU64,
    /// Cancels in-flight transfers
    shutdown: CancellationToken,
    /// Stops the drain and GC passes
    periodic: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Offloader {
    pub fn new(
        cache: Arc<Cache>,
        store: SharedBlockStore,
        index: SharedDedupIndex,
        cfg: &OffloadSection,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            layout: cache.layout(),
            cache,
            store,
            index,
            cfg: cfg.clone(),
            retry: RetryPolicy::from(&cfg.retry),
            queue: TransferQueue::from_config(cfg),
            locks: HashLocks::new(),
            upload_waiters: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            in_flight: AtomicU64::new(0),
            periodic: shutdown.child_token(),
            shutdown,
            tasks: Mutex::new(None),
        })
    }

    /// Spawn the worker pool and the periodic drain and GC passes.
    pub fn start(self: &Arc<Self>, workers: usize) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }
        let mut set = JoinSet::new();
        let workers = workers.max(1);
        for id in 0..workers {
            let this = Arc::clone(self);
            set.spawn(async move { this.worker_loop(id).await });
        }
        let this = Arc::clone(self);
        set.spawn(async move { this.drain_loop().await });
        let this = Arc::clone(self);
        set.spawn(async move { this.gc_loop().await });
        *tasks = Some(set);

        log_offload_info!(
            workers,
            drain_interval_ms = self.cfg.drain_interval_ms,
            gc_interval_ms = self.cfg.gc_interval_ms,
            "Offloader started"
        );
    }

    /// Stop accepting transfers, let queued work finish for up to `timeout`,
    /// then cancel whatever is still running. Blocks left dirty stay in the
    /// WAL for the next start.
    pub async fn shutdown(&self, timeout: Duration) {
        self.queue.close();
        self.periodic.cancel();

        let tasks = self.tasks.lock().take();
        if let Some(mut set) = tasks {
            let drained =
                tokio::time::timeout(timeout, async { while set.join_next().await.is_some() {} })
                    .await;
            if drained.is_err() {
                log_offload_warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Shutdown timed out; cancelling in-flight transfers"
                );
                self.shutdown.cancel();
                set.abort_all();
                while set.join_next().await.is_some() {}
            }
        }
        self.shutdown.cancel();

        let stopped = Arc::new(OffloadError::ShutDown);
        let uploads = std::mem::take(&mut *self.upload_waiters.lock());
        for tx in uploads.into_values().flatten() {
            let _ = tx.send(Err(Arc::clone(&stopped)));
        }
        let downloads = std::mem::take(&mut *self.downloads.lock());
        for tx in downloads.into_values().flatten() {
            let _ = tx.send(Err(Arc::clone(&stopped)));
        }
        log_offload_info!("Offloader stopped");
    }

    async fn worker_loop(&self, id: usize) {
        while let Some(transfer) = self.queue.pop(&self.shutdown).await {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            match transfer.kind {
                TransferKind::Upload => {
                    // Errors are counted, logged and handed to waiters inside
                    let _ = self
                        .upload(&self.shutdown, &transfer.payload, transfer.block)
                        .await;
                }
                TransferKind::Download => self.run_download(&transfer).await,
                TransferKind::Prefetch => self.run_prefetch(&transfer).await,
            }
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        log_offload_debug!(worker = id, "Worker stopped");
    }

    async fn drain_loop(&self) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.cfg.drain_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.periodic.cancelled() => break,
                _ = tick.tick() => {
                    let queued = self.drain();
                    if queued > 0 {
                        log_offload_debug!(queued, "Drain pass");
                    }
                }
            }
        }
    }

    async fn gc_loop(&self) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.cfg.gc_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.periodic.cancelled() => break,
                _ = tick.tick() => {
                    match self.collect_garbage(&self.periodic).await {
                        Ok(_) => {}
                        Err(e) if e.is_cancelled() => break,
                        Err(e) => log_offload_warn!(error = %e, "Garbage collection pass failed"),
                    }
                }
            }
        }
    }

    fn count_retry(&self) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue an upload of one block. Returns `false` when the queue refused
    /// it; the block stays `Pending` for the next drain pass.
    pub fn enqueue_upload(&self, payload: &PayloadId, block: u64) -> bool {
        match self.queue.push(Transfer::upload(payload.clone(), block)) {
            Ok(_) => true,
            Err(Rejected::Full(_)) => {
                self.counters.rejected_uploads.fetch_add(1, Ordering::Relaxed);
                log_offload_debug!(payload = %payload, block, "Upload queue full; left for drain pass");
                false
            }
            Err(Rejected::Closed) => false,
        }
    }

    /// Enqueue every `Pending` block in the cache.
    pub fn drain(&self) -> usize {
        self.cache
            .pending_blocks()
            .into_iter()
            .filter(|(payload, block)| self.enqueue_upload(payload, *block))
            .count()
    }

    /// Queue uploads for everything the cache rebuilt from its WAL.
    pub fn recover(&self) -> usize {
        let queued = self.drain();
        if queued > 0 {
            log_offload_info!(blocks = queued, "Queued recovered blocks for upload");
        }
        queued
    }

    /// Upload one block and settle everyone waiting on it.
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        block: u64,
    ) -> Result<UploadOutcome> {
        let mut superseded = 0;
        let result = loop {
            match self.upload_block(cancel, payload, block).await {
                Ok(UploadOutcome::Superseded) if superseded < SUPERSEDED_RETRIES => {
                    superseded += 1;
                }
                other => break other,
            }
        };

        match result {
            Ok(outcome @ (UploadOutcome::Uploaded { .. } | UploadOutcome::Skipped)) => {
                self.resolve_uploads(payload, block, Ok(()));
                Ok(outcome)
            }
            Ok(UploadOutcome::Superseded) => {
                self.enqueue_upload(payload, block);
                Ok(UploadOutcome::Superseded)
            }
            Ok(UploadOutcome::InFlight) => Ok(UploadOutcome::InFlight),
            Err(e) => {
                if e.is_cancelled() {
                    log_offload_debug!(payload = %payload, block, "Upload cancelled");
                } else {
                    self.counters.upload_failures.fetch_add(1, Ordering::Relaxed);
                    log_offload_error!(payload = %payload, block, error = %e, "Upload failed");
                }
                let shared = Arc::new(e);
                self.resolve_uploads(payload, block, Err(Arc::clone(&shared)));
                Err(OffloadError::Shared(shared))
            }
        }
    }

    #[instrument(skip(self, cancel), level = "debug", fields(payload = %payload))]
    async fn upload_block(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        block: u64,
    ) -> Result<UploadOutcome> {
        let Some(snap) = self.cache.begin_upload(payload, block) else {
            return Ok(match self.cache.block_state(payload, block) {
                Some(BlockState::Uploading) => UploadOutcome::InFlight,
                _ => UploadOutcome::Skipped,
            });
        };
        // Covers errors and a caller dropping this future mid-transfer
        let guard = UploadGuard {
            cache: &self.cache,
            payload,
            block,
            snap,
        };
        let outcome = self.store_snapshot(cancel, payload, block, &guard.snap).await;
        drop(guard);
        outcome
    }

    async fn store_snapshot(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        block: u64,
        snap: &UploadSnapshot,
    ) -> Result<UploadOutcome> {
        let key = self.layout.key(payload, block);
        let content = if snap.complete {
            snap.data.clone()
        } else {
            self.merge_with_durable(cancel, &key, snap).await?
        };
        let hash = BlockHash::compute(&content);
        let size = content.len() as u64;
        let share = payload.share.as_str();
        let location = content_location(share, &hash);

        let _guard = self.locks.lock(share, &hash).await;
        // A zero-reference record may have lost its block to a partial
        // reclaim, so only a live record skips the write
        let deduplicated = self
            .index
            .lookup(share, &hash)?
            .is_some_and(|record| record.refs > 0);
        if !deduplicated {
            self.retry
                .run(
                    cancel,
                    "write_block",
                    || self.count_retry(),
                    || self.store.write_block(cancel, &location, content.clone()),
                )
                .await?;
        }

        let mut bound: Option<BindOutcome> = None;
        let outcome = self.cache.commit_upload(payload, block, snap, || {
            let outcome = self
                .index
                .bind(&key, &hash, size)
                .map_err(|e| CacheError::Index(Box::new(e)))?;
            bound = Some(outcome);
            Ok(())
        })?;

        if outcome == CommitOutcome::Gone {
            if !deduplicated && self.index.lookup(share, &hash)?.is_none() {
                if let Err(e) = self.store.delete_block(cancel, &location).await {
                    if !e.is_not_found() {
                        log_offload_warn!(location = %location, error = %e, "Failed to remove unreferenced block");
                    }
                }
            }
            log_offload_debug!(payload = %payload, block, "Block dropped during upload");
            return Ok(UploadOutcome::Skipped);
        }

        self.counters.uploads.fetch_add(1, Ordering::Relaxed);
        if deduplicated {
            self.counters.dedup_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters
                .bytes_uploaded
                .fetch_add(size, Ordering::Relaxed);
        }
        if let Some(released) = bound.and_then(|b| b.released) {
            if released.orphaned() {
                log_offload_debug!(hash = %released.hash, "Previous content is now unreferenced");
            }
        }
        log_offload_debug!(
            payload = %payload,
            block,
            hash = %hash,
            size,
            deduplicated,
            "Block uploaded"
        );

        Ok(match outcome {
            CommitOutcome::Uploaded => UploadOutcome::Uploaded { deduplicated },
            _ => UploadOutcome::Superseded,
        })
    }

    /// Overlay the snapshot's covered ranges on the block's durable content.
    async fn merge_with_durable(
        &self,
        cancel: &CancellationToken,
        key: &BlockKey,
        snap: &UploadSnapshot,
    ) -> Result<Bytes> {
        let base = self.read_bound(cancel, key).await?.unwrap_or_default();
        let mut merged = vec![0u8; base.len().max(snap.data.len())];
        merged[..base.len()].copy_from_slice(&base);
        for &(a, b) in &snap.coverage {
            let (a, b) = (a as usize, b as usize);
            merged[a..b].copy_from_slice(&snap.data[a..b]);
        }
        Ok(Bytes::from(merged))
    }

    fn resolve_uploads(&self, payload: &PayloadId, block: u64, reply: SharedResult<()>) {
        let waiters = self
            .upload_waiters
            .lock()
            .remove(&(payload.clone(), block))
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(reply.clone());
        }
    }

    /// Read the durable content bound to `key`, or `None` for a hole.
    async fn read_bound(&self, cancel: &CancellationToken, key: &BlockKey) -> Result<Option<Bytes>> {
        let mut missing: Option<String> = None;
        // One more look at the binding: the block may have been rebound and
        // its old content reclaimed between lookup and read
        for _ in 0..2 {
            let Some(binding) = self.index.binding(key)? else {
                return Ok(None);
            };
            if missing.as_deref() == Some(binding.location.as_str()) {
                break;
            }
            let read = self
                .retry
                .run(
                    cancel,
                    "read_block",
                    || self.count_retry(),
                    || self.store.read_block(cancel, &binding.location),
                )
                .await;
            match read {
                Ok(data) => {
                    self.counters.downloads.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_downloaded
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    return Ok(Some(data));
                }
                Err(e) if e.is_not_found() => missing = Some(binding.location),
                Err(e) => return Err(e.into()),
            }
        }
        let location = missing.unwrap_or_default();
        log_dedup_error!(key = %key, location = %location, "Bound block is missing from the store");
        Err(OffloadError::ContentNotFound(format!("{key} -> {location}")))
    }

    /// Durable content of one block, read directly.
    pub async fn durable_block(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        block: u64,
    ) -> Result<Option<Bytes>> {
        self.read_bound(cancel, &self.layout.key(payload, block)).await
    }

    /// Ranged read of a block's durable content without touching the cache.
    pub async fn read_range(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        block: u64,
        offset: u64,
        len: u64,
    ) -> Result<Option<Bytes>> {
        let key = self.layout.key(payload, block);
        let Some(binding) = self.index.binding(&key)? else {
            return Ok(None);
        };
        let data = self
            .retry
            .run(
                cancel,
                "read_block_range",
                || self.count_retry(),
                || self.store.read_block_range(cancel, &binding.location, offset, len),
            )
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    OffloadError::ContentNotFound(format!("{key} -> {}", binding.location))
                } else {
                    e.into()
                }
            })?;
        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_downloaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(Some(data))
    }

    /// Fetch a block through the download queue, caching it on the way.
    ///
    /// Concurrent requests for the same block in the same cache epoch share
    /// one transfer. `None` means the block has never been stored (a hole).
    pub async fn fetch_block(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        block: u64,
        epoch: u64,
    ) -> Result<Option<Bytes>> {
        let (tx, rx) = oneshot::channel();
        let key = (payload.clone(), block, epoch);
        let first = {
            let mut downloads = self.downloads.lock();
            let waiters = downloads.entry(key.clone()).or_default();
            waiters.push(tx);
            waiters.len() == 1
        };
        if first {
            if let Err(rejected) = self.queue.push(Transfer::download(payload.clone(), block, epoch)) {
                let err = match rejected {
                    Rejected::Full(kind) => OffloadError::QueueFull(kind),
                    Rejected::Closed => OffloadError::ShutDown,
                };
                self.resolve_download(&key, Err(Arc::new(err)));
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OffloadError::Cancelled),
            reply = rx => match reply {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(e)) => Err(OffloadError::Shared(e)),
                Err(_) => Err(OffloadError::ShutDown),
            },
        }
    }

    fn resolve_download(&self, key: &DownloadKey, reply: SharedResult<Option<Bytes>>) {
        let waiters = self.downloads.lock().remove(key).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(reply.clone());
        }
    }

    async fn run_download(&self, t: &Transfer) {
        let key = self.layout.key(&t.payload, t.block);
        let result = self.read_bound(&self.shutdown, &key).await;
        if let Ok(Some(data)) = &result {
            if let Err(e) = self
                .cache
                .populate(&t.payload, t.block, 0, data, true, t.epoch)
            {
                log_offload_debug!(key = %key, error = %e, "Downloaded block not cached");
            }
        }
        let reply = result.map_err(|e| {
            self.counters
                .download_failures
                .fetch_add(1, Ordering::Relaxed);
            log_offload_warn!(key = %key, error = %e, "Download failed");
            Arc::new(e)
        });
        self.resolve_download(&(t.payload.clone(), t.block, t.epoch), reply);
    }

    /// Queue best-effort fetches of the blocks after `after`.
    pub fn prefetch(&self, payload: &PayloadId, after: u64, epoch: u64) -> usize {
        (1..=self.cfg.prefetch_blocks)
            .filter(|i| {
                self.queue
                    .push(Transfer::prefetch(payload.clone(), after + i, epoch))
                    .is_ok()
            })
            .count()
    }

    async fn run_prefetch(&self, t: &Transfer) {
        if self.cache.block_state(&t.payload, t.block).is_some() {
            return;
        }
        let key = self.layout.key(&t.payload, t.block);
        match self.read_bound(&self.shutdown, &key).await {
            Ok(Some(data)) => {
                self.counters.prefetches.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self
                    .cache
                    .populate(&t.payload, t.block, 0, &data, true, t.epoch)
                {
                    log_offload_debug!(key = %key, error = %e, "Prefetched block not cached");
                }
            }
            Ok(None) => {}
            Err(e) => log_offload_debug!(key = %key, error = %e, "Prefetch failed"),
        }
    }

    /// Make a payload's dirty blocks durable.
    ///
    /// Without `wait` this only enqueues, unless the payload's dirty bytes
    /// fit under `small_flush_threshold`, in which case the caller uploads
    /// them directly. With `wait` it returns once every block that was dirty
    /// at the time of the call is durable or has failed.
    #[instrument(skip(self, cancel), level = "debug", fields(payload = %payload))]
    pub async fn flush(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        wait: bool,
    ) -> Result<FlushResult> {
        let mut result = FlushResult::default();
        let dirty_bytes = self.cache.dirty_bytes(payload);
        let inline = dirty_bytes > 0 && dirty_bytes <= self.cfg.small_flush_threshold;

        // Register before looking at block states again so no completion is missed
        let mut receivers = Vec::new();
        if wait {
            let blocks = self.cache.unflushed_blocks(payload);
            let mut waiters = self.upload_waiters.lock();
            for block in blocks {
                let (tx, rx) = oneshot::channel();
                waiters.entry((payload.clone(), block)).or_default().push(tx);
                receivers.push((block, rx));
            }
        }

        for block in self.cache.dirty_blocks(payload) {
            if inline {
                if let UploadOutcome::Uploaded { .. } = self.upload(cancel, payload, block).await? {
                    result.uploaded_inline += 1;
                }
            } else if self.enqueue_upload(payload, block) {
                result.enqueued += 1;
            } else if wait {
                self.upload(cancel, payload, block).await?;
                result.uploaded_inline += 1;
            }
        }

        for (block, rx) in receivers {
            // Already settled before the waiter was registered
            if !matches!(
                self.cache.block_state(payload, block),
                Some(BlockState::Pending | BlockState::Uploading)
            ) {
                continue;
            }
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OffloadError::Cancelled),
                reply = rx => reply,
            };
            match reply {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(OffloadError::Shared(e)),
                Err(_) => return Err(OffloadError::ShutDown),
            }
        }

        result.durable = !self.cache.has_unflushed(payload);
        Ok(result)
    }

    /// Flush every payload with dirty blocks.
    pub async fn flush_all(&self, cancel: &CancellationToken, wait: bool) -> Result<FlushResult> {
        let payloads: BTreeSet<PayloadId> = self.cache.unflushed_payloads().into_iter().collect();
        let mut total = FlushResult {
            durable: true,
            ..Default::default()
        };
        for payload in payloads {
            let r = self.flush(cancel, &payload, wait).await?;
            total.enqueued += r.enqueued;
            total.uploaded_inline += r.uploaded_inline;
            total.durable &= r.durable;
        }
        Ok(total)
    }

    /// Cut a payload to `size` bytes and release bindings past the end.
    pub async fn truncate_payload(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        size: u64,
    ) -> Result<()> {
        let layout = self.layout;
        let mut base = TruncateBase::Unknown;
        loop {
            let cut = self.cache.truncate(cancel, payload, size, base.clone(), |first| {
                let key = layout.key(payload, first);
                let released = self
                    .index
                    .unbind_from(payload, key.chunk, key.block)
                    .map_err(|e| CacheError::Index(Box::new(e)))?;
                if !released.is_empty() {
                    log_offload_debug!(payload = %payload, size, released = released.len(), "Released truncated blocks");
                }
                Ok(())
            });
            match cut {
                Err(CacheError::NeedsBase { block }) => {
                    base = match self.durable_block(cancel, payload, block).await? {
                        Some(bytes) => TruncateBase::Durable(bytes),
                        None => TruncateBase::Hole,
                    };
                }
                other => return other.map_err(OffloadError::from),
            }
        }
    }

    /// Drop a payload's cached state and every binding it holds. Returns the
    /// number of references released; storage is reclaimed by the GC pass.
    pub fn delete_payload(&self, cancel: &CancellationToken, payload: &PayloadId) -> Result<usize> {
        let mut released = 0;
        self.cache.delete(cancel, payload, || {
            released = unbind_payload(self.index.as_ref(), payload)
                .map_err(|e| CacheError::Index(Box::new(e)))?
                .len();
            Ok(())
        })?;

        let settled: Vec<_> = {
            let mut waiters = self.upload_waiters.lock();
            let keys: Vec<BlockRef> = waiters
                .keys()
                .filter(|(p, _)| p == payload)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| waiters.remove(&k))
                .flatten()
                .collect()
        };
        for tx in settled {
            let _ = tx.send(Ok(()));
        }
        Ok(released)
    }

    /// Delete the storage of records nobody references any more.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn collect_garbage(&self, cancel: &CancellationToken) -> Result<GcReport> {
        let mut report = GcReport::default();
        for record in self.index.orphans()? {
            if cancel.is_cancelled() {
                return Err(OffloadError::Cancelled);
            }
            let _guard = self.locks.lock(&record.share, &record.hash).await;
            match self.index.lookup(&record.share, &record.hash)? {
                Some(current) if current.refs == 0 => {}
                _ => continue,
            }
            let deleted = self
                .retry
                .run(
                    cancel,
                    "delete_block",
                    || self.count_retry(),
                    || self.store.delete_block(cancel, &record.location),
                )
                .await;
            match deleted {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    log_offload_warn!(location = %record.location, error = %e, "Failed to reclaim block");
                    report.failed += 1;
                    continue;
                }
            }
            if self.index.remove_orphan(&record.share, &record.hash)? {
                report.reclaimed += 1;
                report.bytes += record.size;
            }
        }

        self.counters
            .gc_reclaimed
            .fetch_add(report.reclaimed, Ordering::Relaxed);
        if report.reclaimed > 0 || report.failed > 0 {
            log_offload_info!(
                reclaimed = report.reclaimed,
                bytes = report.bytes,
                failed = report.failed,
                "Garbage collection pass"
            );
        }
        Ok(report)
    }

    /// Compare the store with the index: delete content-addressed blocks no
    /// record references, and report records whose block is missing.
    ///
    /// Meant for startup, before traffic: a record created while the store
    /// is being listed may be reported missing.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let keys = self.store.list_by_prefix(cancel, "").await?;
        let mut present = HashSet::new();

        for key in keys {
            let Some((share, hash)) = parse_content_location(&key) else {
                continue;
            };
            report.scanned += 1;
            let _guard = self.locks.lock(&share, &hash).await;
            if self.index.lookup(&share, &hash)?.is_some() {
                present.insert(key);
                continue;
            }
            match self.store.delete_block(cancel, &key).await {
                Ok(()) => report.removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => log_offload_warn!(key = %key, error = %e, "Failed to remove stray block"),
            }
        }

        for share in self.index.shares()? {
            for record in self.index.records(&share)? {
                if !present.contains(&record.location) {
                    log_dedup_error!(
                        share = %record.share,
                        hash = %record.hash,
                        refs = record.refs,
                        "Dedup record has no backing block"
                    );
                    report.missing.push(record);
                }
            }
        }

        log_offload_info!(
            scanned = report.scanned,
            removed = report.removed,
            missing = report.missing.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.queue.depths()
    }

    pub fn stats(&self) -> OffloadStats {
        let c = &self.counters;
        OffloadStats {
            uploads: c.uploads.load(Ordering::Relaxed),
            dedup_hits: c.dedup_hits.load(Ordering::Relaxed),
            bytes_uploaded: c.bytes_uploaded.load(Ordering::Relaxed),
            downloads: c.downloads.load(Ordering::Relaxed),
            bytes_downloaded: c.bytes_downloaded.load(Ordering::Relaxed),
            prefetches: c.prefetches.load(Ordering::Relaxed),
            upload_failures: c.upload_failures.load(Ordering::Relaxed),
            download_failures: c.download_failures.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            rejected_uploads: c.rejected_uploads.load(Ordering::Relaxed),
            gc_reclaimed: c.gc_reclaimed.load(Ordering::Relaxed),
            queue: self.queue.depths(),
            in_flight: self.in_flight.load(Ordering::Acquire),
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn store(&self) -> &SharedBlockStore {
        &self.store
    }

    pub fn index(&self) -> &SharedDedupIndex {
        &self.index
    }
}
