//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A private WAL file location
//! - A temporary block store root
//! - A temporary LMDB index directory
//!
//! # Usage
//!
//! ```ignore
//! use tide_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.cache.wal_path, config.store.root and config.index.path are isolated
//! }
//! ```

use crate::{Config, IndexBackend, StoreBackend};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Block size used by test configurations (4 KiB).
pub const TEST_BLOCK_SIZE: u64 = 4 * 1024;
/// Chunk size used by test configurations (4 blocks).
pub const TEST_CHUNK_SIZE: u64 = 4 * TEST_BLOCK_SIZE;

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the temporary tree
    pub root: PathBuf,
    /// WAL file for this test
    pub wal_path: PathBuf,
    /// Filesystem block store root
    pub store_root: PathBuf,
    /// LMDB index directory
    pub index_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().to_path_buf();

        let store_root = root.join("blocks");
        let index_path = root.join("dedup.lmdb");
        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&index_path)?;

        let wal_path = root.join(format!("tide-test-{test_id}.wal"));

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            wal_path,
            store_root,
            index_path,
            test_id,
        })
    }

    /// Small-block configuration rooted in this environment.
    ///
    /// Uses in-memory store and index backends; switch `store.backend` /
    /// `index.backend` to exercise the on-disk ones.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.layout.block_size = TEST_BLOCK_SIZE;
        cfg.layout.chunk_size = TEST_CHUNK_SIZE;
        cfg.cache.max_bytes = 64 * TEST_BLOCK_SIZE;
        cfg.cache.wal_path = self.wal_path.clone();
        cfg.cache.wal_initial_size = 256 * 1024;
        cfg.cache.wal_max_size = 16 * 1024 * 1024;
        cfg.offload.workers = Some(4);
        cfg.offload.small_flush_threshold = 0;
        cfg.offload.stream_read_threshold = 8 * TEST_BLOCK_SIZE;
        cfg.offload.drain_interval_ms = 50;
        cfg.offload.gc_interval_ms = 100;
        cfg.offload.shutdown_timeout_ms = 5_000;
        cfg.offload.retry.base_delay_ms = 1;
        cfg.offload.retry.max_delay_ms = 10;
        cfg.store.backend = StoreBackend::Memory;
        cfg.store.root = self.store_root.clone();
        cfg.index.backend = IndexBackend::Memory;
        cfg.index.path = self.index_path.clone();
        cfg
    }

    /// Same as [`config`](Self::config) but with the filesystem store and LMDB index.
    pub fn durable_config(&self) -> Config {
        let mut cfg = self.config();
        cfg.store.backend = StoreBackend::Fs;
        cfg.index.backend = IndexBackend::Lmdb;
        cfg
    }

    /// Write a config file under the environment root and return its path.
    pub fn write_config(&self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
