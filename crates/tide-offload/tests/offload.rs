//! Offloader behaviour against in-memory backends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tide_cache::{BlockState, Cache};
use tide_config::testing::{TestEnvironment, TEST_BLOCK_SIZE};
use tide_config::Config;
use tide_dedup::{DedupIndex, MemoryDedupIndex};
use tide_offload::{Offloader, UploadOutcome};
use tide_store::{
    cancellable, content_location, BlockHash, BlockLayout, BlockStore, MemoryBlockStore,
    PayloadId, SharedBlockStore, StoreError,
};
use tokio_util::sync::CancellationToken;

const BS: u64 = TEST_BLOCK_SIZE;

struct Harness {
    _env: TestEnvironment,
    cfg: Config,
    cache: Arc<Cache>,
    index: Arc<MemoryDedupIndex>,
    offloader: Arc<Offloader>,
    cancel: CancellationToken,
}

fn harness(store: SharedBlockStore) -> Harness {
    harness_with_index(store, Arc::new(MemoryDedupIndex::new()))
}

fn harness_with_index(store: SharedBlockStore, index: Arc<MemoryDedupIndex>) -> Harness {
    let env = TestEnvironment::new().unwrap();
    let cfg = env.config();
    let h = build(&cfg, store, Arc::clone(&index));
    Harness {
        _env: env,
        cfg,
        cache: h.0,
        index,
        offloader: h.1,
        cancel: CancellationToken::new(),
    }
}

fn build(
    cfg: &Config,
    store: SharedBlockStore,
    index: Arc<MemoryDedupIndex>,
) -> (Arc<Cache>, Arc<Offloader>) {
    let cache = Arc::new(Cache::open(BlockLayout::from(&cfg.layout), &cfg.cache).unwrap());
    let offloader = Offloader::new(Arc::clone(&cache), store, index, &cfg.offload);
    (cache, offloader)
}

fn block(fill: u8) -> Vec<u8> {
    vec![fill; BS as usize]
}

/// Fails the first `failures` writes, then delegates.
struct FlakyStore {
    inner: MemoryBlockStore,
    failures: AtomicU64,
    permanent: bool,
}

impl FlakyStore {
    fn new(failures: u64, permanent: bool) -> Self {
        Self {
            inner: MemoryBlockStore::new(),
            failures: AtomicU64::new(failures),
            permanent,
        }
    }
}

#[async_trait]
impl BlockStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn write_block(
        &self,
        cancel: &CancellationToken,
        key: &str,
        data: Bytes,
    ) -> tide_store::Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(if self.permanent {
                StoreError::Permanent("bucket is read-only".into())
            } else {
                StoreError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"))
            });
        }
        self.inner.write_block(cancel, key, data).await
    }

    async fn read_block(&self, cancel: &CancellationToken, key: &str) -> tide_store::Result<Bytes> {
        self.inner.read_block(cancel, key).await
    }

    async fn read_block_range(
        &self,
        cancel: &CancellationToken,
        key: &str,
        offset: u64,
        length: u64,
    ) -> tide_store::Result<Bytes> {
        self.inner.read_block_range(cancel, key, offset, length).await
    }

    async fn delete_block(&self, cancel: &CancellationToken, key: &str) -> tide_store::Result<()> {
        self.inner.delete_block(cancel, key).await
    }

    async fn delete_by_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> tide_store::Result<usize> {
        self.inner.delete_by_prefix(cancel, prefix).await
    }

    async fn list_by_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> tide_store::Result<Vec<String>> {
        self.inner.list_by_prefix(cancel, prefix).await
    }

    async fn health_check(&self, cancel: &CancellationToken) -> tide_store::Result<()> {
        self.inner.health_check(cancel).await
    }
}

/// Delays reads and writes; cancelling the token abandons the call.
struct SlowStore {
    inner: Arc<MemoryBlockStore>,
    write_delay: Duration,
    read_delay: Duration,
}

impl SlowStore {
    fn new(inner: Arc<MemoryBlockStore>, write_delay: Duration, read_delay: Duration) -> Self {
        Self {
            inner,
            write_delay,
            read_delay,
        }
    }
}

#[async_trait]
impl BlockStore for SlowStore {
    fn name(&self) -> &str {
        "slow"
    }

    async fn write_block(
        &self,
        cancel: &CancellationToken,
        key: &str,
        data: Bytes,
    ) -> tide_store::Result<()> {
        cancellable(cancel, async {
            tokio::time::sleep(self.write_delay).await;
            self.inner.write_block(cancel, key, data).await
        })
        .await
    }

    async fn read_block(&self, cancel: &CancellationToken, key: &str) -> tide_store::Result<Bytes> {
        cancellable(cancel, async {
            tokio::time::sleep(self.read_delay).await;
            self.inner.read_block(cancel, key).await
        })
        .await
    }

    async fn read_block_range(
        &self,
        cancel: &CancellationToken,
        key: &str,
        offset: u64,
        length: u64,
    ) -> tide_store::Result<Bytes> {
        self.inner.read_block_range(cancel, key, offset, length).await
    }

    async fn delete_block(&self, cancel: &CancellationToken, key: &str) -> tide_store::Result<()> {
        self.inner.delete_block(cancel, key).await
    }

    async fn delete_by_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> tide_store::Result<usize> {
        self.inner.delete_by_prefix(cancel, prefix).await
    }

    async fn list_by_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> tide_store::Result<Vec<String>> {
        self.inner.list_by_prefix(cancel, prefix).await
    }

    async fn health_check(&self, cancel: &CancellationToken) -> tide_store::Result<()> {
        self.inner.health_check(cancel).await
    }
}

async fn wait_for_state(cache: &Cache, payload: &PayloadId, block: u64, state: BlockState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cache.block_state(payload, block) != Some(state) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "block {block} never reached {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_identical_blocks_are_written_once() {
    let store = Arc::new(MemoryBlockStore::new());
    let h = harness(store.clone());
    h.offloader.start(4);

    let data = block(0x5a);
    let payloads: Vec<_> = (0..8).map(|i| PayloadId::new("share", format!("f{i}"))).collect();
    for p in &payloads {
        h.cache.write_at(&h.cancel, p, 0, &data).unwrap();
    }

    let mut flushes = Vec::new();
    for p in payloads.clone() {
        let offloader = Arc::clone(&h.offloader);
        let cancel = h.cancel.clone();
        flushes.push(tokio::spawn(async move { offloader.flush(&cancel, &p, true).await }));
    }
    for f in flushes {
        assert!(f.await.unwrap().unwrap().durable);
    }

    assert_eq!(store.stats().writes, 1);
    let record = h
        .index
        .lookup("share", &BlockHash::compute(&data))
        .unwrap()
        .unwrap();
    assert_eq!(record.refs, 8);
    assert_eq!(h.offloader.stats().dedup_hits, 7);

    h.offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_flush_is_idempotent() {
    let store = Arc::new(MemoryBlockStore::new());
    let h = harness(store.clone());
    h.offloader.start(2);
    let p = PayloadId::new("share", "doc");

    h.cache.write_at(&h.cancel, &p, 0, &block(1)).unwrap();
    let first = h.offloader.flush(&h.cancel, &p, true).await.unwrap();
    assert!(first.durable);

    let second = h.offloader.flush(&h.cancel, &p, true).await.unwrap();
    assert_eq!(second.enqueued, 0);
    assert_eq!(second.uploaded_inline, 0);
    assert!(second.durable);
    assert_eq!(store.stats().writes, 1);

    h.offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_small_flush_uploads_inline() {
    let env = TestEnvironment::new().unwrap();
    let mut cfg = env.config();
    cfg.offload.small_flush_threshold = BS;
    let store = Arc::new(MemoryBlockStore::new());
    let (cache, offloader) = build(&cfg, store.clone(), Arc::new(MemoryDedupIndex::new()));
    let cancel = CancellationToken::new();
    let p = PayloadId::new("share", "tiny");

    // No workers: only the calling task can make this durable
    cache.write_at(&cancel, &p, 0, b"hello").unwrap();
    let result = offloader.flush(&cancel, &p, false).await.unwrap();
    assert_eq!(result.uploaded_inline, 1);
    assert!(result.durable);
    assert_eq!(cache.block_state(&p, 0), Some(BlockState::Uploaded));
    assert_eq!(store.stats().writes, 1);
}

#[tokio::test]
async fn test_transient_store_errors_are_retried() {
    let store = Arc::new(FlakyStore::new(2, false));
    let h = harness(store.clone());
    let p = PayloadId::new("share", "doc");

    h.cache.write_at(&h.cancel, &p, 0, &block(2)).unwrap();
    let outcome = h.offloader.upload(&h.cancel, &p, 0).await.unwrap();

    assert_eq!(outcome, UploadOutcome::Uploaded { deduplicated: false });
    assert_eq!(h.offloader.stats().retries, 2);
    assert_eq!(h.cache.block_state(&p, 0), Some(BlockState::Uploaded));
}

#[tokio::test]
async fn test_permanent_error_leaves_block_dirty() {
    let store = Arc::new(FlakyStore::new(u64::MAX, true));
    let h = harness(store);
    let p = PayloadId::new("share", "doc");

    h.cache.write_at(&h.cancel, &p, 0, &block(3)).unwrap();
    let err = h.offloader.upload(&h.cancel, &p, 0).await.unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(h.offloader.stats().retries, 0);
    assert_eq!(h.offloader.stats().upload_failures, 1);
    assert_eq!(h.cache.block_state(&p, 0), Some(BlockState::Pending));
    assert!(h
        .index
        .binding(&h.cache.layout().key(&p, 0))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_evicted_block_is_downloaded() {
    let store = Arc::new(MemoryBlockStore::new());
    let h = harness(store.clone());
    h.offloader.start(2);
    let a = PayloadId::new("share", "a");
    let b = PayloadId::new("share", "b");
    let data: Vec<u8> = (0..BS).map(|i| (i % 251) as u8).collect();

    h.cache.write_at(&h.cancel, &a, 0, &data).unwrap();
    assert!(h.offloader.flush(&h.cancel, &a, true).await.unwrap().durable);

    let blocks = h.cfg.cache.max_bytes / BS;
    for i in 0..blocks {
        h.cache.write_at(&h.cancel, &b, i * BS, &block(9)).unwrap();
    }
    assert_eq!(h.cache.block_state(&a, 0), None);

    let read = h.cache.read_at(&h.cancel, &a, 0, BS as usize).unwrap();
    assert_eq!(read.gaps.len(), 1);
    let fetched = h
        .offloader
        .fetch_block(&h.cancel, &a, 0, read.epoch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&fetched[..], &data[..]);
    assert_eq!(store.stats().reads, 1);

    h.offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_unbound_block_fetches_as_hole() {
    let h = harness(Arc::new(MemoryBlockStore::new()));
    h.offloader.start(1);
    let p = PayloadId::new("share", "sparse");

    let got = h.offloader.fetch_block(&h.cancel, &p, 7, 0).await.unwrap();
    assert!(got.is_none());

    h.offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_garbage_collection_after_delete() {
    let store = Arc::new(MemoryBlockStore::new());
    let h = harness(store.clone());
    let p = PayloadId::new("share", "doc");

    h.cache.write_at(&h.cancel, &p, 0, &block(4)).unwrap();
    h.offloader.upload(&h.cancel, &p, 0).await.unwrap();
    assert_eq!(store.len().await, 1);

    assert_eq!(h.offloader.delete_payload(&h.cancel, &p).unwrap(), 1);
    // Still referenced by nobody, but not reclaimed until the GC pass
    assert_eq!(store.len().await, 1);

    let report = h.offloader.collect_garbage(&h.cancel).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.bytes, BS);
    assert!(store.is_empty().await);
    assert!(h.index.orphans().unwrap().is_empty());
}

#[tokio::test]
async fn test_shared_content_survives_one_delete() {
    let store = Arc::new(MemoryBlockStore::new());
    let h = harness(store.clone());
    let a = PayloadId::new("share", "a");
    let b = PayloadId::new("share", "b");

    for p in [&a, &b] {
        h.cache.write_at(&h.cancel, p, 0, &block(5)).unwrap();
        h.offloader.upload(&h.cancel, p, 0).await.unwrap();
    }
    h.offloader.delete_payload(&h.cancel, &a).unwrap();

    let report = h.offloader.collect_garbage(&h.cancel).await.unwrap();
    assert_eq!(report.reclaimed, 0);
    let got = h.offloader.durable_block(&h.cancel, &b, 0).await.unwrap();
    assert_eq!(got.unwrap(), Bytes::from(block(5)));
}

#[tokio::test]
async fn test_reconcile_removes_stray_and_reports_missing() {
    let store = Arc::new(MemoryBlockStore::new());
    let h = harness(store.clone());
    let p = PayloadId::new("share", "doc");

    h.cache.write_at(&h.cancel, &p, 0, &block(6)).unwrap();
    h.offloader.upload(&h.cancel, &p, 0).await.unwrap();
    let stray = content_location("share", &BlockHash::compute(b"stray"));
    store
        .write_block(&h.cancel, &stray, Bytes::from_static(b"stray"))
        .await
        .unwrap();

    let report = h.offloader.reconcile(&h.cancel).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.removed, 1);
    assert!(report.missing.is_empty());
    assert!(!store.contains(&stray).await);

    let live = content_location("share", &BlockHash::compute(&block(6)));
    store.delete_block(&h.cancel, &live).await.unwrap();
    let report = h.offloader.reconcile(&h.cancel).await.unwrap();
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.missing[0].location, live);
}

#[tokio::test]
async fn test_truncate_uses_durable_prefix() {
    let store = Arc::new(MemoryBlockStore::new());
    let index = Arc::new(MemoryDedupIndex::new());
    let cancel = CancellationToken::new();
    let p = PayloadId::new("share", "doc");
    let data: Vec<u8> = (0..2 * BS).map(|i| (i % 97) as u8).collect();

    let first_env = TestEnvironment::new().unwrap();
    let (cache, offloader) = build(&first_env.config(), store.clone(), Arc::clone(&index));
    cache.write_at(&cancel, &p, 0, &data).unwrap();
    offloader.upload(&cancel, &p, 0).await.unwrap();
    offloader.upload(&cancel, &p, 1).await.unwrap();

    // A cold cache over the same durable state
    let second_env = TestEnvironment::new().unwrap();
    let (cache, offloader) = build(&second_env.config(), store.clone(), Arc::clone(&index));
    offloader.truncate_payload(&cancel, &p, BS + 10).await.unwrap();
    assert_eq!(cache.block_state(&p, 1), Some(BlockState::Pending));

    offloader.upload(&cancel, &p, 1).await.unwrap();
    let tail = offloader.durable_block(&cancel, &p, 1).await.unwrap().unwrap();
    assert_eq!(&tail[..], &data[BS as usize..BS as usize + 10]);
    let head = offloader.durable_block(&cancel, &p, 0).await.unwrap().unwrap();
    assert_eq!(&head[..], &data[..BS as usize]);
}

#[tokio::test]
async fn test_recovered_blocks_are_uploaded() {
    let env = TestEnvironment::new().unwrap();
    let cfg = env.config();
    let cancel = CancellationToken::new();
    let p = PayloadId::new("share", "doc");

    let cache = Cache::open(BlockLayout::from(&cfg.layout), &cfg.cache).unwrap();
    cache.write_at(&cancel, &p, 0, &block(7)).unwrap();
    cache.write_at(&cancel, &p, BS, b"tail").unwrap();
    std::mem::forget(cache);

    let store = Arc::new(MemoryBlockStore::new());
    let (cache, offloader) = build(&cfg, store.clone(), Arc::new(MemoryDedupIndex::new()));
    assert_eq!(offloader.recover(), 2);
    offloader.start(2);

    let result = offloader.flush_all(&cancel, true).await.unwrap();
    assert!(result.durable);
    assert_eq!(store.stats().writes, 2);
    assert!(!cache.has_unflushed(&p));

    offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_dropped_inline_flush_returns_block_to_pending() {
    let env = TestEnvironment::new().unwrap();
    let mut cfg = env.config();
    cfg.offload.small_flush_threshold = BS;
    let memory = Arc::new(MemoryBlockStore::new());
    let store = Arc::new(SlowStore::new(
        memory.clone(),
        Duration::from_millis(200),
        Duration::ZERO,
    ));
    let (cache, offloader) = build(&cfg, store, Arc::new(MemoryDedupIndex::new()));
    let cancel = CancellationToken::new();
    let p = PayloadId::new("share", "tiny");

    cache.write_at(&cancel, &p, 0, b"hello").unwrap();
    let timed_out =
        tokio::time::timeout(Duration::from_millis(50), offloader.flush(&cancel, &p, false)).await;
    assert!(timed_out.is_err());
    assert_eq!(cache.block_state(&p, 0), Some(BlockState::Pending));
    assert_eq!(memory.stats().writes, 0);

    offloader.start(1);
    let result = tokio::time::timeout(Duration::from_secs(5), offloader.flush(&cancel, &p, true))
        .await
        .unwrap()
        .unwrap();
    assert!(result.durable);
    assert_eq!(cache.block_state(&p, 0), Some(BlockState::Uploaded));
    assert_eq!(memory.stats().writes, 1);

    offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_cancelled_upload_is_retried_by_drain() {
    let memory = Arc::new(MemoryBlockStore::new());
    let store = Arc::new(SlowStore::new(
        memory.clone(),
        Duration::from_millis(200),
        Duration::ZERO,
    ));
    let h = harness(store);
    let p = PayloadId::new("share", "doc");
    h.cache.write_at(&h.cancel, &p, 0, &block(8)).unwrap();

    let token = CancellationToken::new();
    let upload = {
        let offloader = Arc::clone(&h.offloader);
        let token = token.clone();
        let p = p.clone();
        tokio::spawn(async move { offloader.upload(&token, &p, 0).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let err = upload.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.cache.block_state(&p, 0), Some(BlockState::Pending));
    assert_eq!(h.offloader.stats().upload_failures, 0);
    assert_eq!(memory.stats().writes, 0);

    h.offloader.start(1);
    wait_for_state(&h.cache, &p, 0, BlockState::Uploaded).await;
    assert_eq!(memory.stats().writes, 1);

    h.offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_cancelled_fetch_leaves_no_partial_block() {
    let memory = Arc::new(MemoryBlockStore::new());
    let index = Arc::new(MemoryDedupIndex::new());
    let p = PayloadId::new("share", "doc");
    let data: Vec<u8> = (0..BS).map(|i| (i % 241) as u8).collect();

    let writer_env = TestEnvironment::new().unwrap();
    let (cache, offloader) = build(&writer_env.config(), memory.clone(), Arc::clone(&index));
    cache.write_at(&CancellationToken::new(), &p, 0, &data).unwrap();
    offloader.upload(&CancellationToken::new(), &p, 0).await.unwrap();

    let store = Arc::new(SlowStore::new(
        memory.clone(),
        Duration::ZERO,
        Duration::from_millis(200),
    ));
    let h = harness_with_index(store, index);
    h.offloader.start(1);
    let epoch = h.cache.read_at(&h.cancel, &p, 0, 1).unwrap().epoch;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });
    let err = h.offloader.fetch_block(&token, &p, 0, epoch).await.unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(h.cache.block_state(&p, 0), None);

    // Whatever the abandoned transfer leaves is the whole block or nothing
    tokio::time::sleep(Duration::from_millis(300)).await;
    let read = h.cache.read_at(&h.cancel, &p, 0, BS as usize).unwrap();
    if read.gaps.is_empty() {
        assert_eq!(read.data, data);
    } else {
        assert_eq!(read.gaps.len(), 1);
        assert_eq!(read.gaps[0].len, BS);
        assert!(!read.gaps[0].cached);
    }

    let fetched = h
        .offloader
        .fetch_block(&h.cancel, &p, 0, read.epoch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&fetched[..], &data[..]);

    h.offloader.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_truncate_after_eviction_drops_durable_tail() {
    let env = TestEnvironment::new().unwrap();
    let mut cfg = env.config();
    cfg.cache.max_bytes = BS;
    let store = Arc::new(MemoryBlockStore::new());
    let (cache, offloader) = build(&cfg, store.clone(), Arc::new(MemoryDedupIndex::new()));
    let cancel = CancellationToken::new();
    let p = PayloadId::new("share", "doc");
    let q = PayloadId::new("share", "other");
    let data: Vec<u8> = (0..BS).map(|i| (i % 89) as u8).collect();

    cache.write_at(&cancel, &p, 0, &data).unwrap();
    offloader.upload(&cancel, &p, 0).await.unwrap();
    cache.write_at(&cancel, &q, 0, b"pressure").unwrap();
    assert_eq!(cache.block_state(&p, 0), None);

    offloader.truncate_payload(&cancel, &p, 10).await.unwrap();
    assert_eq!(cache.block_state(&p, 0), Some(BlockState::Pending));
    offloader.upload(&cancel, &p, 0).await.unwrap();

    let durable = offloader.durable_block(&cancel, &p, 0).await.unwrap().unwrap();
    assert_eq!(&durable[..], &data[..10]);
}
