//! # tide-config
//!
//! Configuration management for Tidepool.
//!
//! Loads configuration from:
//! 1. `~/.tidepool/config.toml` (global)
//! 2. `.tidepool/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
/// Default chunk size: 64 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub layout: LayoutConfig,
    pub cache: CacheSection,
    pub offload: OffloadSection,
    pub store: StoreSection,
    pub index: IndexSection,
    pub log: LogSection,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = PathBuf::from(".tidepool/config.toml");
        Self::load_from(global.as_deref(), Some(&project))
    }

    /// Load config from explicit global and project files. Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, table);
            }
        }

        let mut config: Config = toml::Value::Table(merged).try_into()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.tidepool/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".tidepool/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TIDE_WAL_PATH") {
            self.cache.wal_path = PathBuf::from(path);
        }
        if let Ok(bytes) = std::env::var("TIDE_CACHE_MAX_BYTES") {
            if let Ok(n) = bytes.parse() {
                self.cache.max_bytes = n;
            }
        }
        if let Ok(workers) = std::env::var("TIDE_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.offload.workers = Some(n);
            }
        }
        if let Ok(root) = std::env::var("TIDE_STORE_ROOT") {
            self.store.root = PathBuf::from(root);
        }
    }

    /// Reject layouts and limits the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bs = self.layout.block_size;
        if bs == 0 || !bs.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "block_size must be a non-zero power of two, got {bs}"
            )));
        }
        if self.layout.chunk_size < bs || self.layout.chunk_size % bs != 0 {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} must be a multiple of block_size {bs}",
                self.layout.chunk_size
            )));
        }
        if self.cache.max_bytes < bs {
            return Err(ConfigError::Invalid(format!(
                "cache.max_bytes {} is smaller than one block",
                self.cache.max_bytes
            )));
        }
        if self.cache.wal_max_size < self.cache.wal_initial_size {
            return Err(ConfigError::Invalid(
                "cache.wal_max_size must be >= cache.wal_initial_size".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cache.wal_compact_ratio) {
            return Err(ConfigError::Invalid(
                "cache.wal_compact_ratio must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.offload.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "offload.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of transfer workers (configured or one per CPU).
    pub fn worker_count(&self) -> usize {
        self.offload.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Recursively overlay `overlay` onto `base`; scalar values and arrays replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Block geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub block_size: u64,
    pub chunk_size: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// In-memory cache and write-ahead log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Memory ceiling for block buffers
    pub max_bytes: u64,
    /// WAL file location
    pub wal_path: PathBuf,
    /// Initial size of the mapped WAL file
    pub wal_initial_size: u64,
    /// Hard ceiling for the WAL file; writes fail beyond it
    pub wal_max_size: u64,
    /// Fraction of the WAL still live after compaction above which the file grows
    pub wal_compact_ratio: f64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
            wal_path: PathBuf::from("~/.tidepool/cache.wal"),
            wal_initial_size: 64 * 1024 * 1024,
            wal_max_size: 4 * 1024 * 1024 * 1024,
            wal_compact_ratio: 0.5,
        }
    }
}

/// Background transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadSection {
    /// Worker tasks (None = one per CPU)
    pub workers: Option<usize>,
    pub download_queue: usize,
    pub upload_queue: usize,
    pub prefetch_queue: usize,
    /// Blocks fetched ahead of a sequential read
    pub prefetch_blocks: u64,
    /// Payloads with at most this many dirty bytes are flushed inline
    pub small_flush_threshold: u64,
    /// Uncached reads at least this long stream from the block store
    pub stream_read_threshold: u64,
    pub drain_interval_ms: u64,
    pub gc_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub retry: RetrySection,
}

impl Default for OffloadSection {
    fn default() -> Self {
        Self {
            workers: None,
            download_queue: 1024,
            upload_queue: 4096,
            prefetch_queue: 256,
            prefetch_blocks: 2,
            small_flush_threshold: 64 * 1024,
            stream_read_threshold: 16 * 1024 * 1024,
            drain_interval_ms: 5_000,
            gc_interval_ms: 60_000,
            shutdown_timeout_ms: 30_000,
            retry: RetrySection::default(),
        }
    }
}

/// Exponential backoff for backend calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

/// Durable block storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Fs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// Root directory for the filesystem backend
    pub root: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Fs,
            root: PathBuf::from("~/.tidepool/blocks"),
        }
    }
}

/// Dedup index backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Memory,
    #[default]
    Lmdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSection {
    pub backend: IndexBackend,
    /// LMDB environment directory
    pub path: PathBuf,
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Lmdb,
            path: PathBuf::from("~/.tidepool/dedup.lmdb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from("/tmp").join(rest)),
        Err(_) => path.to_path_buf(),
    }
}
