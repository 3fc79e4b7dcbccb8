//! Payload entries, block buffers and the cache operations over them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tide_config::{expand_home, log_cache_debug, log_cache_info, log_cache_warn, CacheSection};
use tide_store::{BlockLayout, PayloadId};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::coverage::Coverage;
use crate::lru::LruIndex;
use crate::wal::{Wal, WalOp, WalOptions, WalRecord, WalUsage};
use crate::{CacheError, Result};

/// LRU entries examined per eviction attempt.
const EVICT_SCAN: usize = 64;

/// Durability state of one block buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockState {
    /// Dirty, only in memory and the WAL
    Pending,
    /// Transfer in flight
    Uploading,
    /// Durable; may be evicted
    Uploaded,
}

#[derive(Debug)]
struct BlockBuffer {
    data: Vec<u8>,
    coverage: Coverage,
    state: BlockState,
    /// LSN of the last write, 0 for clean data
    seq: u64,
    /// Distinguishes this buffer from a later one at the same index
    birth: u64,
    /// Uncovered bytes are zeros rather than unknown
    authoritative: bool,
}

impl BlockBuffer {
    fn new(birth: u64, state: BlockState) -> Self {
        Self {
            data: Vec::new(),
            coverage: Coverage::new(),
            state,
            seq: 0,
            birth,
            authoritative: false,
        }
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    blocks: BTreeMap<u64, BlockBuffer>,
    /// Set once the entry has been unlinked from the map
    retired: bool,
}

/// The entry a reservation is made for, already locked by the caller.
struct Own<'a> {
    payload: &'a PayloadId,
    entry: &'a mut CacheEntry,
    /// Blocks the caller is about to write; never evicted
    protect: &'a [u64],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub written: usize,
    /// Blocks that became fully covered by this write
    pub completed: Vec<u64>,
}

/// A byte range the cache could not serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGap {
    pub index: u64,
    /// Offset inside the block
    pub offset: u64,
    pub len: u64,
    /// Offset inside the read buffer
    pub buf_offset: u64,
    /// A buffer exists for the block but does not cover this range
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct CacheRead {
    /// Requested bytes; zeros wherever a gap is reported
    pub data: Vec<u8>,
    pub gaps: Vec<CacheGap>,
    /// Pass back to [`Cache::populate`] when filling the gaps
    pub epoch: u64,
    /// Whether the payload had a cache entry at all
    pub found: bool,
}

/// Durable content of the block a truncate cuts through.
#[derive(Debug, Clone, Default)]
pub enum TruncateBase {
    /// Not looked up yet
    #[default]
    Unknown,
    /// The block has no durable content
    Hole,
    Durable(Bytes),
}

/// Block content captured by [`Cache::begin_upload`].
#[derive(Debug, Clone)]
pub struct UploadSnapshot {
    pub data: Bytes,
    pub coverage: Vec<(u64, u64)>,
    pub seq: u64,
    pub birth: u64,
    pub authoritative: bool,
    /// `data` is the whole block; no durable content needs merging in
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The snapshot is now the durable content; the buffer is evictable.
    Uploaded,
    /// Bound, but the buffer was written again meanwhile and stays dirty.
    Superseded,
    /// The buffer was dropped by truncate or delete; nothing was bound.
    Gone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub used_bytes: u64,
    pub max_bytes: u64,
    /// Bytes in buffers that are not durable yet
    pub dirty_bytes: u64,
    pub pending_blocks: u64,
    pub uploading_blocks: u64,
    pub uploaded_blocks: u64,
    pub payloads: u64,
    pub wal_used: u64,
    pub wal_capacity: u64,
}

/// In-memory block cache backed by a write-ahead log.
pub struct Cache {
    layout: BlockLayout,
    max_bytes: u64,
    entries: DashMap<PayloadId, Arc<Mutex<CacheEntry>>>,
    used: AtomicU64,
    clock: AtomicU64,
    births: AtomicU64,
    /// Bumped by truncate and delete; stale populates are rejected
    epoch: AtomicU64,
    lru: Mutex<LruIndex>,
    wal: Mutex<Option<Wal>>,
    closed: AtomicBool,
}

impl Cache {
    /// Open the WAL named in `cfg`, replay it and rebuild unflushed blocks
    /// as `Pending`.
    pub fn open(layout: BlockLayout, cfg: &CacheSection) -> Result<Self> {
        let wal_path = expand_home(&cfg.wal_path);
        let (wal, recovered) = Wal::open(
            &wal_path,
            WalOptions {
                block_size: layout.block_size,
                initial_size: cfg.wal_initial_size,
                max_size: cfg.wal_max_size,
                compact_ratio: cfg.wal_compact_ratio,
            },
        )?;

        let cache = Self {
            layout,
            max_bytes: cfg.max_bytes,
            entries: DashMap::new(),
            used: AtomicU64::new(0),
            clock: AtomicU64::new(1),
            births: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            lru: Mutex::new(LruIndex::default()),
            wal: Mutex::new(Some(wal)),
            closed: AtomicBool::new(false),
        };

        let count = recovered.len();
        let mut bytes = 0u64;
        for ((payload, index), block) in recovered {
            let size = block.data.len() as u64;
            let arc = cache.entry_or_create(&payload);
            let mut entry = arc.lock();
            entry.blocks.insert(
                index,
                BlockBuffer {
                    data: block.data,
                    coverage: block.coverage,
                    state: BlockState::Pending,
                    seq: block.seq,
                    birth: cache.births.fetch_add(1, Ordering::Relaxed),
                    authoritative: block.authoritative,
                },
            );
            bytes += size;
        }
        cache.used.store(bytes, Ordering::Release);

        if count > 0 {
            log_cache_info!(
                path = %wal_path.display(),
                blocks = count,
                bytes,
                "Recovered unflushed blocks from WAL"
            );
            if bytes > cache.max_bytes {
                log_cache_warn!(
                    bytes,
                    max_bytes = cache.max_bytes,
                    "Recovered data exceeds cache capacity; writes block until it drains"
                );
            }
        }
        Ok(cache)
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn entry(&self, payload: &PayloadId) -> Option<Arc<Mutex<CacheEntry>>> {
        self.entries.get(payload).map(|e| Arc::clone(e.value()))
    }

    fn entry_or_create(&self, payload: &PayloadId) -> Arc<Mutex<CacheEntry>> {
        Arc::clone(self.entries.entry(payload.clone()).or_default().value())
    }

    /// Unlink an entry that holds no blocks.
    fn discard_if_empty(
        &self,
        payload: &PayloadId,
        arc: &Arc<Mutex<CacheEntry>>,
        mut entry: MutexGuard<'_, CacheEntry>,
    ) {
        if entry.blocks.is_empty() && !entry.retired {
            entry.retired = true;
            drop(entry);
            self.entries.remove_if(payload, |_, v| Arc::ptr_eq(v, arc));
        }
    }

    fn wal_append(&self, records: &[WalRecord<'_>]) -> Result<Vec<u64>> {
        let mut wal = self.wal.lock();
        let wal = wal.as_mut().ok_or(CacheError::Closed)?;
        wal.append_batch(records)
    }

    fn release(&self, bytes: u64) {
        if bytes > 0 {
            self.used.fetch_sub(bytes, Ordering::AcqRel);
        }
    }

    /// Account for `need` more bytes, evicting `Uploaded` buffers as needed.
    fn reserve(&self, need: u64, mut own: Option<&mut Own<'_>>) -> Result<()> {
        if need == 0 {
            return Ok(());
        }
        loop {
            let used = self.used.load(Ordering::Acquire);
            if used + need <= self.max_bytes {
                if self
                    .used
                    .compare_exchange(used, used + need, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if !self.evict_one(own.as_deref_mut()) {
                return Err(CacheError::CacheFull {
                    needed: need,
                    used,
                    capacity: self.max_bytes,
                });
            }
        }
    }

    /// Evict the least recently used `Uploaded` buffer that can be taken
    /// without waiting. Returns `false` when nothing was evictable.
    fn evict_one(&self, mut own: Option<&mut Own<'_>>) -> bool {
        let candidates = self.lru.lock().oldest(EVICT_SCAN);
        for (payload, index) in candidates {
            let key = (payload, index);

            if let Some(o) = own.as_deref_mut() {
                if o.payload == &key.0 {
                    if o.protect.contains(&index) {
                        continue;
                    }
                    let evicted = match o.entry.blocks.get(&index) {
                        Some(b) if b.state == BlockState::Uploaded => {
                            o.entry.blocks.remove(&index).map(|b| b.size())
                        }
                        _ => None,
                    };
                    // Anything still tracked for a non-Uploaded buffer is stale
                    self.lru.lock().remove(&key);
                    if let Some(size) = evicted {
                        self.release(size);
                        log_cache_debug!(payload = %key.0, block = index, "Evicted own block");
                        return true;
                    }
                    continue;
                }
            }

            let Some(arc) = self.entry(&key.0) else {
                continue;
            };
            let Some(mut entry) = arc.try_lock() else {
                continue;
            };
            if entry.retired {
                continue;
            }
            let evictable = entry
                .blocks
                .get(&index)
                .is_some_and(|b| b.state == BlockState::Uploaded);
            self.lru.lock().remove(&key);
            if !evictable {
                continue;
            }
            if let Some(b) = entry.blocks.remove(&index) {
                self.release(b.size());
            }
            log_cache_debug!(payload = %key.0, block = index, "Evicted block");
            self.discard_if_empty(&key.0, &arc, entry);
            return true;
        }
        false
    }

    /// Buffer `data` at `offset` and log it before returning.
    ///
    /// Either the whole write is accepted or none of it is.
    #[instrument(skip(self, cancel, data), level = "debug", fields(payload = %payload, len = data.len()))]
    pub fn write_at(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        offset: u64,
        data: &[u8],
    ) -> Result<WriteOutcome> {
        self.check(cancel)?;
        if data.is_empty() {
            return Ok(WriteOutcome::default());
        }
        let spans = self.layout.spans(offset, data.len() as u64);
        let indices: Vec<u64> = spans.iter().map(|s| s.index).collect();

        loop {
            let arc = self.entry_or_create(payload);
            let mut guard = arc.lock();
            if guard.retired {
                continue;
            }
            let entry = &mut *guard;

            let growth: u64 = spans
                .iter()
                .map(|s| {
                    let held = entry.blocks.get(&s.index).map_or(0, BlockBuffer::size);
                    (s.offset + s.len).saturating_sub(held)
                })
                .sum();
            let reserved = self.reserve(
                growth,
                Some(&mut Own {
                    payload,
                    entry: &mut *entry,
                    protect: &indices,
                }),
            );
            if let Err(e) = reserved {
                self.discard_if_empty(payload, &arc, guard);
                return Err(e);
            }

            let records: Vec<WalRecord<'_>> = spans
                .iter()
                .map(|s| WalRecord {
                    payload,
                    block: s.index,
                    op: WalOp::Write {
                        auth: false,
                        offset: s.offset,
                        data: &data[s.buf_offset as usize..(s.buf_offset + s.len) as usize],
                    },
                })
                .collect();
            let lsns = match self.wal_append(&records) {
                Ok(lsns) => lsns,
                Err(e) => {
                    self.release(growth);
                    self.discard_if_empty(payload, &arc, guard);
                    return Err(e);
                }
            };

            let entry = &mut *guard;
            let mut completed = Vec::new();
            for (s, lsn) in spans.iter().zip(lsns) {
                let buf = entry.blocks.entry(s.index).or_insert_with(|| {
                    BlockBuffer::new(
                        self.births.fetch_add(1, Ordering::Relaxed),
                        BlockState::Pending,
                    )
                });
                let start = s.offset as usize;
                let end = (s.offset + s.len) as usize;
                if buf.data.len() < end {
                    buf.data.resize(end, 0);
                }
                buf.data[start..end]
                    .copy_from_slice(&data[s.buf_offset as usize..(s.buf_offset + s.len) as usize]);
                buf.coverage.insert(s.offset, s.offset + s.len);
                if buf.state == BlockState::Uploaded {
                    self.lru.lock().remove(&(payload.clone(), s.index));
                }
                buf.state = BlockState::Pending;
                buf.seq = lsn;
                if buf.coverage.is_covered(0, self.layout.block_size) {
                    completed.push(s.index);
                }
            }

            return Ok(WriteOutcome {
                written: data.len(),
                completed,
            });
        }
    }

    /// Copy whatever the cache holds for `[offset, offset + len)`.
    pub fn read_at(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        offset: u64,
        len: usize,
    ) -> Result<CacheRead> {
        self.check(cancel)?;
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut data = vec![0u8; len];
        let spans = self.layout.spans(offset, len as u64);
        let miss = |s: &tide_store::BlockSpan| CacheGap {
            index: s.index,
            offset: s.offset,
            len: s.len,
            buf_offset: s.buf_offset,
            cached: false,
        };

        let Some(arc) = self.entry(payload) else {
            let gaps = spans.iter().map(miss).collect();
            return Ok(CacheRead {
                data,
                gaps,
                epoch,
                found: false,
            });
        };
        let entry = arc.lock();
        if entry.retired {
            let gaps = spans.iter().map(miss).collect();
            return Ok(CacheRead {
                data,
                gaps,
                epoch,
                found: false,
            });
        }

        let mut gaps = Vec::new();
        let mut touched = Vec::new();
        for s in &spans {
            let Some(buf) = entry.blocks.get(&s.index) else {
                gaps.push(miss(s));
                continue;
            };
            let (l, r) = (s.offset, s.offset + s.len);
            for (a, b) in buf.coverage.covered_within(l, r) {
                let dst = (s.buf_offset + (a - l)) as usize;
                data[dst..dst + (b - a) as usize].copy_from_slice(&buf.data[a as usize..b as usize]);
            }
            if !buf.authoritative {
                for (a, b) in buf.coverage.gaps(l, r) {
                    gaps.push(CacheGap {
                        index: s.index,
                        offset: a,
                        len: b - a,
                        buf_offset: s.buf_offset + (a - l),
                        cached: true,
                    });
                }
            }
            if buf.state == BlockState::Uploaded {
                touched.push(s.index);
            }
        }
        if !touched.is_empty() {
            let mut lru = self.lru.lock();
            for index in touched {
                lru.refresh(&(payload.clone(), index), self.tick());
            }
        }

        Ok(CacheRead {
            data,
            gaps,
            epoch,
            found: true,
        })
    }

    /// Insert clean durable bytes into the uncovered parts of a block.
    ///
    /// `whole` means `bytes` is the block's entire durable content, so bytes
    /// beyond it are holes. Returns `false` when nothing was cached: the
    /// payload was truncated or deleted since `epoch`, or no room could be
    /// made.
    pub fn populate(
        &self,
        payload: &PayloadId,
        index: u64,
        offset: u64,
        bytes: &[u8],
        whole: bool,
        epoch: u64,
    ) -> Result<bool> {
        if self.is_closed() {
            return Err(CacheError::Closed);
        }
        if bytes.is_empty() {
            return Ok(true);
        }
        let arc = self.entry_or_create(payload);
        let mut guard = arc.lock();
        if guard.retired {
            return Ok(false);
        }
        if self.epoch.load(Ordering::Acquire) != epoch {
            self.discard_if_empty(payload, &arc, guard);
            return Ok(false);
        }

        let end = offset + bytes.len() as u64;
        let (fills, held, existed) = match guard.blocks.get(&index) {
            Some(buf) if buf.authoritative => return Ok(true),
            Some(buf) => (buf.coverage.gaps(offset, end), buf.size(), true),
            None => (vec![(offset, end)], 0, false),
        };
        let fill_end = fills.last().map_or(0, |&(_, b)| b);
        let growth = fill_end.saturating_sub(held);

        let entry = &mut *guard;
        let reserved = self.reserve(
            growth,
            Some(&mut Own {
                payload,
                entry: &mut *entry,
                protect: &[index],
            }),
        );
        if reserved.is_err() {
            self.discard_if_empty(payload, &arc, guard);
            return Ok(false);
        }

        let entry = &mut *guard;
        let buf = entry.blocks.entry(index).or_insert_with(|| {
            BlockBuffer::new(
                self.births.fetch_add(1, Ordering::Relaxed),
                BlockState::Uploaded,
            )
        });
        if buf.data.len() < fill_end as usize {
            buf.data.resize(fill_end as usize, 0);
        }
        for (a, b) in fills {
            let src = (a - offset) as usize;
            buf.data[a as usize..b as usize].copy_from_slice(&bytes[src..src + (b - a) as usize]);
            buf.coverage.insert(a, b);
        }
        if whole {
            buf.authoritative = true;
        }
        if buf.state == BlockState::Uploaded {
            let key = (payload.clone(), index);
            let tick = self.tick();
            let mut lru = self.lru.lock();
            if existed {
                lru.refresh(&key, tick);
            } else {
                lru.touch(key, tick);
            }
        }
        Ok(true)
    }

    /// Move a `Pending` block to `Uploading` and capture its content.
    pub fn begin_upload(&self, payload: &PayloadId, index: u64) -> Option<UploadSnapshot> {
        let arc = self.entry(payload)?;
        let mut entry = arc.lock();
        if entry.retired {
            return None;
        }
        let buf = entry.blocks.get_mut(&index)?;
        if buf.state != BlockState::Pending {
            return None;
        }
        buf.state = BlockState::Uploading;
        Some(UploadSnapshot {
            data: Bytes::copy_from_slice(&buf.data),
            coverage: buf.coverage.ranges().to_vec(),
            seq: buf.seq,
            birth: buf.birth,
            authoritative: buf.authoritative,
            complete: buf.authoritative || buf.coverage.is_covered(0, self.layout.block_size),
        })
    }

    /// Finish an upload started with [`begin_upload`](Self::begin_upload).
    ///
    /// `bind` records the uploaded content in the dedup index and runs under
    /// the entry lock, so it serialises with truncate and delete. It is not
    /// called when the buffer is gone. If `bind` fails the block returns to
    /// `Pending`.
    pub fn commit_upload<F>(
        &self,
        payload: &PayloadId,
        index: u64,
        snap: &UploadSnapshot,
        bind: F,
    ) -> Result<CommitOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let Some(arc) = self.entry(payload) else {
            return Ok(CommitOutcome::Gone);
        };
        let mut entry = arc.lock();
        if entry.retired {
            return Ok(CommitOutcome::Gone);
        }
        let Some(buf) = entry.blocks.get_mut(&index) else {
            return Ok(CommitOutcome::Gone);
        };
        if buf.birth != snap.birth {
            return Ok(CommitOutcome::Gone);
        }

        if let Err(e) = bind() {
            if buf.state == BlockState::Uploading && buf.seq == snap.seq {
                buf.state = BlockState::Pending;
            }
            return Err(e);
        }

        if buf.state != BlockState::Uploading || buf.seq != snap.seq {
            return Ok(CommitOutcome::Superseded);
        }
        buf.state = BlockState::Uploaded;
        let seq = buf.seq;
        self.lru.lock().touch((payload.clone(), index), self.tick());

        let marker = WalRecord {
            payload,
            block: index,
            op: WalOp::Uploaded { seq },
        };
        if let Err(e) = self.wal_append(&[marker]) {
            // Replay re-uploads the block; the index makes that a no-op
            log_cache_warn!(payload = %payload, block = index, error = %e, "Failed to log upload marker");
        }
        Ok(CommitOutcome::Uploaded)
    }

    /// Return an `Uploading` block to `Pending` after a failed transfer.
    pub fn abort_upload(&self, payload: &PayloadId, index: u64, snap: &UploadSnapshot) {
        let Some(arc) = self.entry(payload) else {
            return;
        };
        let mut entry = arc.lock();
        if let Some(buf) = entry.blocks.get_mut(&index) {
            if buf.birth == snap.birth
                && buf.seq == snap.seq
                && buf.state == BlockState::Uploading
            {
                buf.state = BlockState::Pending;
            }
        }
    }

    /// Cut the payload to `size` bytes.
    ///
    /// A partially kept block becomes authoritative and dirty; its retained
    /// prefix is built from the buffer, with `base` (the block's durable
    /// content) filling bytes the buffer does not cover. When those bytes are
    /// needed and `base` is [`TruncateBase::Unknown`], nothing changes and
    /// [`CacheError::NeedsBase`] names the block to fetch. `unbind` receives
    /// the first dropped block index and runs under the entry lock.
    #[instrument(skip(self, cancel, base, unbind), level = "debug", fields(payload = %payload))]
    pub fn truncate<F>(
        &self,
        cancel: &CancellationToken,
        payload: &PayloadId,
        size: u64,
        base: TruncateBase,
        unbind: F,
    ) -> Result<()>
    where
        F: FnOnce(u64) -> Result<()>,
    {
        self.check(cancel)?;
        let bs = self.layout.block_size;
        let (cut, rem) = (size / bs, size % bs);
        let first_dropped = if rem > 0 { cut + 1 } else { cut };

        let durable = match &base {
            TruncateBase::Durable(bytes) => Some(bytes),
            _ => None,
        };
        let base_known = !matches!(base, TruncateBase::Unknown);

        loop {
            let arc = if rem > 0 && durable.is_some() {
                Some(self.entry_or_create(payload))
            } else {
                self.entry(payload)
            };
            let Some(arc) = arc else {
                if rem > 0 && !base_known {
                    return Err(CacheError::NeedsBase { block: cut });
                }
                self.wal_append(&[WalRecord {
                    payload,
                    block: cut,
                    op: WalOp::Truncate { size },
                }])?;
                self.epoch.fetch_add(1, Ordering::AcqRel);
                return unbind(first_dropped);
            };
            let mut guard = arc.lock();
            if guard.retired {
                continue;
            }

            let prefix: Option<Vec<u8>> = if rem == 0 {
                None
            } else {
                let buf = guard.blocks.get(&cut);
                let covered = buf.is_some_and(|b| b.authoritative || b.coverage.is_covered(0, rem));
                if !covered && !base_known {
                    self.discard_if_empty(payload, &arc, guard);
                    return Err(CacheError::NeedsBase { block: cut });
                }
                if buf.is_none() && durable.is_none() {
                    None
                } else {
                    let mut p = vec![0u8; rem as usize];
                    let auth = buf.is_some_and(|b| b.authoritative);
                    if let (false, Some(base)) = (auth, durable) {
                        let n = base.len().min(p.len());
                        p[..n].copy_from_slice(&base[..n]);
                    }
                    if let Some(buf) = buf {
                        for (a, b) in buf.coverage.covered_within(0, rem) {
                            p[a as usize..b as usize].copy_from_slice(&buf.data[a as usize..b as usize]);
                        }
                    }
                    Some(p)
                }
            };

            let held = guard.blocks.get(&cut).map_or(0, BlockBuffer::size);
            let growth = match &prefix {
                Some(p) => (p.len() as u64).saturating_sub(held),
                None => 0,
            };
            let entry = &mut *guard;
            let reserved = self.reserve(
                growth,
                Some(&mut Own {
                    payload,
                    entry: &mut *entry,
                    protect: &[cut],
                }),
            );
            if let Err(e) = reserved {
                self.discard_if_empty(payload, &arc, guard);
                return Err(e);
            }

            let mut records = Vec::with_capacity(2);
            if let Some(p) = &prefix {
                records.push(WalRecord {
                    payload,
                    block: cut,
                    op: WalOp::Write {
                        auth: true,
                        offset: 0,
                        data: p,
                    },
                });
            }
            records.push(WalRecord {
                payload,
                block: cut,
                op: WalOp::Truncate { size },
            });
            let lsns = match self.wal_append(&records) {
                Ok(lsns) => lsns,
                Err(e) => {
                    self.release(growth);
                    self.discard_if_empty(payload, &arc, guard);
                    return Err(e);
                }
            };

            let entry = &mut *guard;
            let dropped: Vec<u64> = entry.blocks.range(first_dropped..).map(|(i, _)| *i).collect();
            let mut freed = 0;
            {
                let mut lru = self.lru.lock();
                for index in &dropped {
                    if let Some(buf) = entry.blocks.remove(index) {
                        freed += buf.size();
                        lru.remove(&(payload.clone(), *index));
                    }
                }
            }

            if let Some(p) = prefix {
                let buf = entry.blocks.entry(cut).or_insert_with(|| {
                    BlockBuffer::new(
                        self.births.fetch_add(1, Ordering::Relaxed),
                        BlockState::Pending,
                    )
                });
                freed += buf.size().saturating_sub(p.len() as u64);
                if buf.state == BlockState::Uploaded {
                    self.lru.lock().remove(&(payload.clone(), cut));
                }
                buf.coverage = Coverage::full(p.len() as u64);
                buf.data = p;
                buf.authoritative = true;
                buf.state = BlockState::Pending;
                buf.seq = lsns[0];
            }
            self.release(freed);
            self.epoch.fetch_add(1, Ordering::AcqRel);

            log_cache_debug!(
                payload = %payload,
                size,
                dropped = dropped.len(),
                "Truncated cache entry"
            );
            let unbound = unbind(first_dropped);
            self.discard_if_empty(payload, &arc, guard);
            return unbound;
        }
    }

    /// Drop every buffer of a payload, dirty or not.
    ///
    /// `unbind` releases the payload's durable bindings and runs under the
    /// entry lock.
    #[instrument(skip(self, cancel, unbind), level = "debug", fields(payload = %payload))]
    pub fn delete<F>(&self, cancel: &CancellationToken, payload: &PayloadId, unbind: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.check(cancel)?;
        let Some(arc) = self.entry(payload) else {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            return unbind();
        };
        let mut entry = arc.lock();
        if !entry.retired {
            self.wal_append(&[WalRecord {
                payload,
                block: 0,
                op: WalOp::Delete,
            }])?;
            entry.retired = true;
            let blocks = std::mem::take(&mut entry.blocks);
            let mut freed = 0;
            {
                let mut lru = self.lru.lock();
                for (index, buf) in blocks {
                    freed += buf.size();
                    lru.remove(&(payload.clone(), index));
                }
            }
            self.release(freed);
            self.entries.remove_if(payload, |_, v| Arc::ptr_eq(v, &arc));
            log_cache_debug!(payload = %payload, freed, "Dropped cache entry");
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        unbind()
    }

    /// Indices of `Pending` blocks of one payload.
    pub fn dirty_blocks(&self, payload: &PayloadId) -> Vec<u64> {
        let Some(arc) = self.entry(payload) else {
            return Vec::new();
        };
        let entry = arc.lock();
        entry
            .blocks
            .iter()
            .filter(|(_, b)| b.state == BlockState::Pending)
            .map(|(i, _)| *i)
            .collect()
    }

    /// Indices of blocks of one payload that are `Pending` or `Uploading`.
    pub fn unflushed_blocks(&self, payload: &PayloadId) -> Vec<u64> {
        let Some(arc) = self.entry(payload) else {
            return Vec::new();
        };
        let entry = arc.lock();
        entry
            .blocks
            .iter()
            .filter(|(_, b)| b.state != BlockState::Uploaded)
            .map(|(i, _)| *i)
            .collect()
    }

    /// Bytes of one payload not yet durable.
    pub fn dirty_bytes(&self, payload: &PayloadId) -> u64 {
        let Some(arc) = self.entry(payload) else {
            return 0;
        };
        let entry = arc.lock();
        entry
            .blocks
            .values()
            .filter(|b| b.state != BlockState::Uploaded)
            .map(BlockBuffer::size)
            .sum()
    }

    /// Whether any block of the payload is `Pending` or `Uploading`.
    pub fn has_unflushed(&self, payload: &PayloadId) -> bool {
        let Some(arc) = self.entry(payload) else {
            return false;
        };
        let entry = arc.lock();
        entry.blocks.values().any(|b| b.state != BlockState::Uploaded)
    }

    pub fn block_state(&self, payload: &PayloadId, index: u64) -> Option<BlockState> {
        let arc = self.entry(payload)?;
        let entry = arc.lock();
        entry.blocks.get(&index).map(|b| b.state)
    }

    fn snapshot_entries(&self) -> Vec<(PayloadId, Arc<Mutex<CacheEntry>>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    /// Every `Pending` block across all payloads.
    pub fn pending_blocks(&self) -> Vec<(PayloadId, u64)> {
        let mut out = Vec::new();
        for (payload, arc) in self.snapshot_entries() {
            let entry = arc.lock();
            out.extend(
                entry
                    .blocks
                    .iter()
                    .filter(|(_, b)| b.state == BlockState::Pending)
                    .map(|(i, _)| (payload.clone(), *i)),
            );
        }
        out
    }

    /// Payloads with at least one `Pending` or `Uploading` block.
    pub fn unflushed_payloads(&self) -> Vec<PayloadId> {
        self.snapshot_entries()
            .into_iter()
            .filter(|(_, arc)| {
                arc.lock()
                    .blocks
                    .values()
                    .any(|b| b.state != BlockState::Uploaded)
            })
            .map(|(payload, _)| payload)
            .collect()
    }

    pub fn wal_usage(&self) -> WalUsage {
        self.wal.lock().as_ref().map(Wal::usage).unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            used_bytes: self.used_bytes(),
            max_bytes: self.max_bytes,
            ..Default::default()
        };
        for (_, arc) in self.snapshot_entries() {
            let entry = arc.lock();
            if entry.retired {
                continue;
            }
            stats.payloads += 1;
            for buf in entry.blocks.values() {
                match buf.state {
                    BlockState::Pending => stats.pending_blocks += 1,
                    BlockState::Uploading => stats.uploading_blocks += 1,
                    BlockState::Uploaded => stats.uploaded_blocks += 1,
                }
                if buf.state != BlockState::Uploaded {
                    stats.dirty_bytes += buf.size();
                }
            }
        }
        let wal = self.wal_usage();
        stats.wal_used = wal.used;
        stats.wal_capacity = wal.capacity;
        stats
    }

    pub fn sync(&self) -> Result<()> {
        let mut wal = self.wal.lock();
        wal.as_mut().ok_or(CacheError::Closed)?.sync()
    }

    /// Flush and release the WAL. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let wal = self.wal.lock().take();
        if let Some(mut wal) = wal {
            wal.sync()?;
            log_cache_info!(used = self.used_bytes(), "Cache closed");
        }
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log_cache_warn!(error = %e, "Failed to close cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tide_config::testing::{TestEnvironment, TEST_BLOCK_SIZE};

    const BS: u64 = TEST_BLOCK_SIZE;

    fn open(env: &TestEnvironment, max_blocks: u64) -> Cache {
        let mut cfg = env.config();
        cfg.cache.max_bytes = max_blocks * BS;
        Cache::open(BlockLayout::from(&cfg.layout), &cfg.cache).unwrap()
    }

    fn p(id: &str) -> PayloadId {
        PayloadId::new("share", id)
    }

    fn upload(cache: &Cache, payload: &PayloadId, index: u64) -> CommitOutcome {
        let snap = cache.begin_upload(payload, index).unwrap();
        cache.commit_upload(payload, index, &snap, || Ok(())).unwrap()
    }

    #[test]
    fn test_write_then_read_spans_blocks() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 16);
        let cancel = CancellationToken::new();
        let data: Vec<u8> = (0..3 * BS).map(|i| (i % 251) as u8).collect();

        let out = cache.write_at(&cancel, &p("f"), 100, &data).unwrap();
        assert_eq!(out.written, data.len());
        // Blocks 1 and 2 are fully covered; 0 and 3 only partially
        assert_eq!(out.completed, vec![1, 2]);
        assert_eq!(cache.dirty_blocks(&p("f")), vec![0, 1, 2, 3]);

        let read = cache.read_at(&cancel, &p("f"), 100, data.len()).unwrap();
        assert!(read.gaps.is_empty());
        assert_eq!(read.data, data);
        assert_eq!(cache.used_bytes(), 3 * BS + 100);
    }

    #[test]
    fn test_read_reports_gaps() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 16);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 10, b"abc").unwrap();

        let read = cache.read_at(&cancel, &p("f"), 0, (BS + 10) as usize).unwrap();
        assert_eq!(&read.data[10..13], b"abc");
        let gaps: Vec<_> = read.gaps.iter().map(|g| (g.index, g.offset, g.len, g.cached)).collect();
        assert_eq!(
            gaps,
            vec![(0, 0, 10, true), (0, 13, BS - 13, true), (1, 0, 10, false)]
        );

        let missing = cache.read_at(&cancel, &p("other"), 0, 10).unwrap();
        assert!(!missing.found);
        assert_eq!(missing.gaps.len(), 1);
    }

    #[test]
    fn test_cache_full_with_only_dirty_data() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 4);
        let cancel = CancellationToken::new();
        let block = vec![1u8; BS as usize];
        for i in 0..4 {
            cache.write_at(&cancel, &p("f"), i * BS, &block).unwrap();
        }
        let err = cache.write_at(&cancel, &p("g"), 0, &block).unwrap_err();
        assert!(err.is_cache_full());
        // The rejected write left nothing behind
        assert_eq!(cache.stats().payloads, 1);
        assert_eq!(cache.used_bytes(), 4 * BS);
    }

    #[test]
    fn test_uploading_block_is_not_evicted() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 2);
        let cancel = CancellationToken::new();
        let block = vec![2u8; BS as usize];
        cache.write_at(&cancel, &p("a"), 0, &block).unwrap();
        cache.write_at(&cancel, &p("b"), 0, &block).unwrap();
        let snap = cache.begin_upload(&p("a"), 0).unwrap();
        assert_eq!(upload(&cache, &p("b"), 0), CommitOutcome::Uploaded);

        // Room comes from the uploaded block only
        cache.write_at(&cancel, &p("c"), 0, &block).unwrap();
        assert_eq!(cache.block_state(&p("b"), 0), None);
        assert_eq!(cache.block_state(&p("a"), 0), Some(BlockState::Uploading));

        let err = cache.write_at(&cancel, &p("d"), 0, &block).unwrap_err();
        assert!(err.is_cache_full());
        assert_eq!(cache.block_state(&p("a"), 0), Some(BlockState::Uploading));

        let outcome = cache.commit_upload(&p("a"), 0, &snap, || Ok(())).unwrap();
        assert_eq!(outcome, CommitOutcome::Uploaded);
        cache.write_at(&cancel, &p("d"), 0, &block).unwrap();
        assert_eq!(cache.block_state(&p("a"), 0), None);
    }

    #[test]
    fn test_uploaded_blocks_are_evicted_lru_first() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 2);
        let cancel = CancellationToken::new();
        let block = vec![7u8; BS as usize];
        cache.write_at(&cancel, &p("a"), 0, &block).unwrap();
        cache.write_at(&cancel, &p("b"), 0, &block).unwrap();
        assert_eq!(upload(&cache, &p("a"), 0), CommitOutcome::Uploaded);
        assert_eq!(upload(&cache, &p("b"), 0), CommitOutcome::Uploaded);

        // Touch "a" so "b" is the oldest
        cache.read_at(&cancel, &p("a"), 0, 1).unwrap();
        cache.write_at(&cancel, &p("c"), 0, &block).unwrap();

        assert_eq!(cache.block_state(&p("a"), 0), Some(BlockState::Uploaded));
        assert_eq!(cache.block_state(&p("b"), 0), None);
        assert_eq!(cache.used_bytes(), 2 * BS);
    }

    #[test]
    fn test_write_during_upload_supersedes() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 0, b"one").unwrap();
        let snap = cache.begin_upload(&p("f"), 0).unwrap();
        assert!(cache.begin_upload(&p("f"), 0).is_none());

        cache.write_at(&cancel, &p("f"), 0, b"two").unwrap();
        let outcome = cache.commit_upload(&p("f"), 0, &snap, || Ok(())).unwrap();
        assert_eq!(outcome, CommitOutcome::Superseded);
        assert_eq!(cache.block_state(&p("f"), 0), Some(BlockState::Pending));
    }

    #[test]
    fn test_commit_after_delete_is_gone() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 0, b"data").unwrap();
        let snap = cache.begin_upload(&p("f"), 0).unwrap();
        cache.delete(&cancel, &p("f"), || Ok(())).unwrap();

        let mut bound = false;
        let outcome = cache
            .commit_upload(&p("f"), 0, &snap, || {
                bound = true;
                Ok(())
            })
            .unwrap();
        assert_eq!(outcome, CommitOutcome::Gone);
        assert!(!bound);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_failed_bind_returns_block_to_pending() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 0, b"data").unwrap();
        let snap = cache.begin_upload(&p("f"), 0).unwrap();
        let err = cache
            .commit_upload(&p("f"), 0, &snap, || {
                Err(CacheError::Index("boom".into()))
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::Index(_)));
        assert_eq!(cache.block_state(&p("f"), 0), Some(BlockState::Pending));

        let snap = cache.begin_upload(&p("f"), 0).unwrap();
        cache.abort_upload(&p("f"), 0, &snap);
        assert_eq!(cache.block_state(&p("f"), 0), Some(BlockState::Pending));
    }

    #[test]
    fn test_populate_never_overwrites_dirty_bytes() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 4, b"DIRTY").unwrap();

        let read = cache.read_at(&cancel, &p("f"), 0, 16).unwrap();
        let durable = vec![b'.'; 16];
        assert!(cache.populate(&p("f"), 0, 0, &durable, false, read.epoch).unwrap());

        let read = cache.read_at(&cancel, &p("f"), 0, 16).unwrap();
        assert_eq!(&read.data, b"....DIRTY.......");
        assert_eq!(cache.block_state(&p("f"), 0), Some(BlockState::Pending));
    }

    #[test]
    fn test_populate_whole_marks_holes() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        let read = cache.read_at(&cancel, &p("f"), 0, BS as usize).unwrap();
        assert!(cache.populate(&p("f"), 0, 0, b"short", true, read.epoch).unwrap());

        let read = cache.read_at(&cancel, &p("f"), 0, BS as usize).unwrap();
        assert!(read.gaps.is_empty());
        assert_eq!(&read.data[..5], b"short");
        assert!(read.data[5..].iter().all(|&b| b == 0));
        assert_eq!(cache.block_state(&p("f"), 0), Some(BlockState::Uploaded));
    }

    #[test]
    fn test_populate_rejected_after_truncate() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        let read = cache.read_at(&cancel, &p("f"), 0, 16).unwrap();
        cache
            .truncate(&cancel, &p("f"), 0, TruncateBase::Unknown, |_| Ok(()))
            .unwrap();
        assert!(!cache.populate(&p("f"), 0, 0, b"stale", true, read.epoch).unwrap());
        assert_eq!(cache.stats().payloads, 0);
    }

    #[test]
    fn test_truncate_mid_block() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        let data = vec![3u8; (2 * BS) as usize];
        cache.write_at(&cancel, &p("f"), 0, &data).unwrap();
        upload(&cache, &p("f"), 0);
        upload(&cache, &p("f"), 1);

        let mut first_dropped = None;
        cache
            .truncate(&cancel, &p("f"), BS + 10, TruncateBase::Unknown, |i| {
                first_dropped = Some(i);
                Ok(())
            })
            .unwrap();
        assert_eq!(first_dropped, Some(2));
        assert_eq!(cache.block_state(&p("f"), 1), Some(BlockState::Pending));
        assert_eq!(cache.block_state(&p("f"), 0), Some(BlockState::Uploaded));

        let snap = cache.begin_upload(&p("f"), 1).unwrap();
        assert!(snap.authoritative);
        assert!(snap.complete);
        assert_eq!(snap.data.len(), 10);
        assert_eq!(cache.used_bytes(), BS + 10);

        // Bytes past the new end read back as zeros
        let read = cache.read_at(&cancel, &p("f"), BS, BS as usize).unwrap();
        assert!(read.gaps.is_empty());
        assert!(read.data[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncate_uses_base_for_uncovered_prefix() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 2, b"XY").unwrap();

        let err = cache
            .truncate(&cancel, &p("f"), 6, TruncateBase::Unknown, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, CacheError::NeedsBase { block: 0 }));

        let base = Bytes::from_static(b"abcdefgh");
        cache
            .truncate(&cancel, &p("f"), 6, TruncateBase::Durable(base), |_| Ok(()))
            .unwrap();
        let read = cache.read_at(&cancel, &p("f"), 0, 8).unwrap();
        assert_eq!(&read.data, b"abXYef\0\0");

        // Authoritative now: no base needed for a shorter cut
        cache
            .truncate(&cancel, &p("f"), 4, TruncateBase::Unknown, |_| Ok(()))
            .unwrap();
    }

    #[test]
    fn test_truncate_of_evicted_block_asks_for_base() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 1);
        let cancel = CancellationToken::new();
        cache.write_at(&cancel, &p("f"), 0, &vec![4u8; BS as usize]).unwrap();
        upload(&cache, &p("f"), 0);

        // Pressure from another payload evicts the clean block
        cache.write_at(&cancel, &p("g"), 0, b"pressure").unwrap();
        assert_eq!(cache.block_state(&p("f"), 0), None);

        let mut unbound = false;
        let err = cache
            .truncate(&cancel, &p("f"), 10, TruncateBase::Unknown, |_| {
                unbound = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, CacheError::NeedsBase { block: 0 }));
        assert!(!unbound);

        cache
            .truncate(&cancel, &p("f"), 10, TruncateBase::Hole, |_| Ok(()))
            .unwrap();
        assert_eq!(cache.block_state(&p("f"), 0), None);
    }

    #[test]
    fn test_closed_cache_rejects_calls() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        cache.close().unwrap();
        cache.close().unwrap();
        let cancel = CancellationToken::new();
        assert!(matches!(
            cache.write_at(&cancel, &p("f"), 0, b"x"),
            Err(CacheError::Closed)
        ));
    }

    #[test]
    fn test_cancelled_write_is_rejected() {
        let env = TestEnvironment::new().unwrap();
        let cache = open(&env, 8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            cache.write_at(&cancel, &p("f"), 0, b"x"),
            Err(CacheError::Cancelled)
        ));
        assert_eq!(cache.stats().payloads, 0);
    }
}
