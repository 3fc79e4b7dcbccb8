//! Local filesystem block store.
//!
//! Keys map 1:1 onto relative paths below `root`, so the content-addressed
//! key layout produces the same 3-level fan-out on disk:
//!
//! ```text
//! <root>/
//! └── <share>/blocks/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...ef
//! ```

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tide_config::{log_store_debug, log_store_warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{cancellable, BlockStore, Result, StoreError};

const TEMP_SUFFIX: &str = ".tmp";

/// Unique temp names for concurrent writers in one process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path, rejecting anything that could escape `root`.
    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.ends_with(TEMP_SUFFIX) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            crate::key::validate_segment(segment)
                .map_err(|_| StoreError::InvalidKey(key.to_string()))?;
            path.push(segment);
        }
        Ok(path)
    }

    /// Directory to walk for `prefix`: the deepest complete segment path.
    fn walk_root(&self, prefix: &str) -> PathBuf {
        match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        }
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

fn map_io(err: io::Error, key: &str) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound {
            key: key.to_string(),
        },
        io::ErrorKind::PermissionDenied => StoreError::Permanent(format!("{key}: {err}")),
        _ => StoreError::Io(err),
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    fn name(&self) -> &str {
        "fs"
    }

    #[instrument(skip(self, cancel, data), fields(len = data.len()), level = "debug")]
    async fn write_block(&self, cancel: &CancellationToken, key: &str, data: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let temp_path = path.with_file_name(format!(
            "{}.{}.{}{TEMP_SUFFIX}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| map_io(e, key))?;
            }
            let mut file = tokio::fs::File::create(&temp_path)
                .await
                .map_err(|e| map_io(e, key))?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &path)
                .await
                .map_err(|e| map_io(e, key))?;
            Ok::<(), StoreError>(())
        };

        let res = cancellable(cancel, write).await;
        if res.is_err() {
            // Never leave a half-written temp file behind
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    log_store_warn!(path = %temp_path.display(), error = %e, "failed to remove temp file");
                }
            }
        }
        res
    }

    async fn read_block(&self, cancel: &CancellationToken, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        cancellable(cancel, async {
            let data = tokio::fs::read(&path).await.map_err(|e| map_io(e, key))?;
            Ok(Bytes::from(data))
        })
        .await
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn read_block_range(
        &self,
        cancel: &CancellationToken,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes> {
        let path = self.path_for(key)?;
        cancellable(cancel, async {
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| map_io(e, key))?;
            let size = file.metadata().await?.len();
            if offset >= size {
                return Ok(Bytes::new());
            }
            let take = length.min(size - offset);
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = Vec::with_capacity(take as usize);
            file.take(take).read_to_end(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    async fn delete_block(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        cancellable(cancel, async {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| map_io(e, key))
        })
        .await
    }

    async fn delete_by_prefix(&self, cancel: &CancellationToken, prefix: &str) -> Result<usize> {
        let keys = self.list_by_prefix(cancel, prefix).await?;
        let mut removed = 0;
        for key in keys {
            match self.delete_block(cancel, &key).await {
                Ok(()) => removed += 1,
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        log_store_debug!(prefix, removed, "deleted by prefix");
        Ok(removed)
    }

    async fn list_by_prefix(
        &self,
        cancel: &CancellationToken,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let walk_root = self.walk_root(prefix);
        let store = self.clone();
        let prefix_owned = prefix.to_string();

        let listing = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !walk_root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&walk_root).follow_links(false) {
                let entry = entry.map_err(|e| StoreError::Io(io::Error::other(e.to_string())))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                if let Some(key) = store.key_for(entry.path()) {
                    if key.starts_with(&prefix_owned) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        });

        cancellable(cancel, async {
            listing
                .await
                .map_err(|e| StoreError::Io(io::Error::other(e.to_string())))?
        })
        .await
    }

    async fn health_check(&self, cancel: &CancellationToken) -> Result<()> {
        let probe = self.root.join(format!(".health.{}", std::process::id()));
        cancellable(cancel, async {
            tokio::fs::create_dir_all(&self.root).await?;
            tokio::fs::write(&probe, b"ok")
                .await
                .map_err(|e| map_io(e, ".health"))?;
            tokio::fs::remove_file(&probe).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FsBlockStore, CancellationToken) {
        let temp = TempDir::new().unwrap();
        let store = FsBlockStore::new(temp.path().join("store")).unwrap();
        (temp, store, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_write_creates_fan_out_path() {
        let (_temp, store, token) = setup();
        store
            .write_block(&token, "s/blocks/ab/cd/abcdef", Bytes::from_static(b"data"))
            .await
            .unwrap();
        let path = store.root().join("s/blocks/ab/cd/abcdef");
        assert!(path.exists());
        assert_eq!(std::fs::read(path).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_no_temp_files_remain() {
        let (_temp, store, token) = setup();
        store
            .write_block(&token, "s/blocks/00/11/f", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(store.root().join("s/blocks/00/11"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_read_range_and_not_found() {
        let (_temp, store, token) = setup();
        store
            .write_block(&token, "s/k", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        assert_eq!(store.read_block_range(&token, "s/k", 3, 4).await.unwrap(), "3456");
        assert_eq!(store.read_block_range(&token, "s/k", 7, 100).await.unwrap(), "789");
        assert!(store.read_block_range(&token, "s/k", 10, 1).await.unwrap().is_empty());

        let err = store.read_block(&token, "s/missing").await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.delete_block(&token, "s/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_and_delete_by_prefix() {
        let (_temp, store, token) = setup();
        for key in ["a/blocks/00/01/x", "a/blocks/02/03/y", "b/blocks/00/01/z"] {
            store
                .write_block(&token, key, Bytes::from_static(b"1"))
                .await
                .unwrap();
        }

        let listed = store.list_by_prefix(&token, "a/blocks/").await.unwrap();
        assert_eq!(listed, vec!["a/blocks/00/01/x", "a/blocks/02/03/y"]);
        assert!(store.list_by_prefix(&token, "zz/").await.unwrap().is_empty());

        assert_eq!(store.delete_by_prefix(&token, "a/").await.unwrap(), 2);
        assert_eq!(store.list_by_prefix(&token, "").await.unwrap(), vec!["b/blocks/00/01/z"]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_temp, store, token) = setup();
        for key in ["../x", "/abs", "a//b", "a/./b", "a/b.tmp", ""] {
            let err = store
                .write_block(&token, key, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "key {key:?}");
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_temp, store, token) = setup();
        store.health_check(&token).await.unwrap();
    }
}
