//! LMDB-backed dedup index for persistent, crash-safe reference counts.
//!
//! Two databases in one environment; every mutation is one write
//! transaction, so a crash leaves either the old or the new state.
//!
//! ```text
//! records:  share \0 hash[32]                          → StoredRecord
//! bindings: share \0 id \0 chunk_be[8] block_be[8]     → StoredBinding
//! ```

use std::collections::HashMap;
use std::path::Path;

use heed::types::{Bytes, SerdeBincode};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tide_config::log_dedup_debug;
use tide_store::{content_location, BlockHash, BlockKey, PayloadId};
use tracing::{debug, instrument};

use crate::{
    inconsistent, BindOutcome, BlockBinding, DedupError, DedupIndex, DedupRecord, DedupStats,
    Released, Result,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    location: String,
    size: u64,
    refs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBinding {
    hash: [u8; 32],
    size: u64,
}

pub struct LmdbDedupIndex {
    env: Env,
    records_db: Database<Bytes, SerdeBincode<StoredRecord>>,
    bindings_db: Database<Bytes, SerdeBincode<StoredBinding>>,
}

fn record_key(share: &str, hash: &BlockHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(share.len() + 33);
    key.extend_from_slice(share.as_bytes());
    key.push(0);
    key.extend_from_slice(hash.as_bytes());
    key
}

fn split_record_key(key: &[u8]) -> Result<(String, BlockHash)> {
    let sep = key
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| DedupError::Corrupted("record key without separator".to_string()))?;
    let hash: [u8; 32] = key[sep + 1..]
        .try_into()
        .map_err(|_| DedupError::Corrupted("record key with bad hash length".to_string()))?;
    let share = std::str::from_utf8(&key[..sep])
        .map_err(|_| DedupError::Corrupted("record key share is not UTF-8".to_string()))?;
    Ok((share.to_string(), BlockHash(hash)))
}

fn payload_prefix(payload: &PayloadId) -> Vec<u8> {
    let mut key = Vec::with_capacity(payload.share.len() + payload.id.len() + 2);
    key.extend_from_slice(payload.share.as_bytes());
    key.push(0);
    key.extend_from_slice(payload.id.as_bytes());
    key.push(0);
    key
}

fn binding_key(key: &BlockKey) -> Vec<u8> {
    let mut out = payload_prefix(&key.payload);
    out.extend_from_slice(&key.chunk.to_be_bytes());
    out.extend_from_slice(&key.block.to_be_bytes());
    out
}

/// Chunk and block from the fixed-size tail of a binding key.
fn split_binding_tail(raw: &[u8], prefix_len: usize) -> Result<(u64, u64)> {
    let tail = &raw[prefix_len..];
    if tail.len() != 16 {
        return Err(DedupError::Corrupted("binding key with bad tail".to_string()));
    }
    let mut chunk = [0u8; 8];
    let mut block = [0u8; 8];
    chunk.copy_from_slice(&tail[..8]);
    block.copy_from_slice(&tail[8..]);
    Ok((u64::from_be_bytes(chunk), u64::from_be_bytes(block)))
}

impl LmdbDedupIndex {
    /// Default LMDB map size: 1GB (expandable)
    const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

    /// Maximum readers
    const MAX_READERS: u32 = 128;

    /// Open or create an index in directory `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_readers(Self::MAX_READERS)
                .max_dbs(2)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let records_db = env.create_database(&mut wtxn, Some("records"))?;
        let bindings_db = env.create_database(&mut wtxn, Some("bindings"))?;
        wtxn.commit()?;

        debug!("Opened LMDB dedup index at {:?}", path);

        Ok(Self {
            env,
            records_db,
            bindings_db,
        })
    }

    fn to_record(share: &str, hash: BlockHash, rec: StoredRecord) -> DedupRecord {
        DedupRecord {
            share: share.to_string(),
            hash,
            location: rec.location,
            size: rec.size,
            refs: rec.refs,
        }
    }

    fn to_binding(share: &str, stored: &StoredBinding) -> BlockBinding {
        let hash = BlockHash(stored.hash);
        BlockBinding {
            hash,
            location: content_location(share, &hash),
            size: stored.size,
        }
    }

    /// Load the record a release would decrement, failing if it cannot be decremented.
    fn releasable(&self, txn: &RoTxn, share: &str, hash: &BlockHash) -> Result<StoredRecord> {
        match self.records_db.get(txn, &record_key(share, hash))? {
            None => Err(inconsistent(format!(
                "binding points at missing record {share}/{hash}"
            ))),
            Some(rec) if rec.refs == 0 => Err(inconsistent(format!(
                "refcount of {share}/{hash} would go negative"
            ))),
            Some(rec) => Ok(rec),
        }
    }

    fn release(
        &self,
        txn: &mut RwTxn,
        share: &str,
        hash: BlockHash,
        mut rec: StoredRecord,
    ) -> Result<Released> {
        rec.refs -= 1;
        self.records_db
            .put(txn, &record_key(share, &hash), &rec)?;
        Ok(Released {
            share: share.to_string(),
            hash,
            remaining: rec.refs,
        })
    }

    fn payload_bindings(
        &self,
        txn: &RoTxn,
        payload: &PayloadId,
    ) -> Result<Vec<(BlockKey, StoredBinding)>> {
        let prefix = payload_prefix(payload);
        let mut out = Vec::new();
        for item in self.bindings_db.prefix_iter(txn, &prefix)? {
            let (raw, stored) = item?;
            let (chunk, block) = split_binding_tail(raw, prefix.len())?;
            out.push((
                BlockKey {
                    payload: payload.clone(),
                    chunk,
                    block,
                },
                stored,
            ));
        }
        Ok(out)
    }
}

impl DedupIndex for LmdbDedupIndex {
    fn lookup(&self, share: &str, hash: &BlockHash) -> Result<Option<DedupRecord>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .records_db
            .get(&rtxn, &record_key(share, hash))?
            .map(|rec| Self::to_record(share, *hash, rec)))
    }

    #[instrument(skip(self), level = "debug")]
    fn bind(&self, key: &BlockKey, hash: &BlockHash, size: u64) -> Result<BindOutcome> {
        let share = key.payload.share.as_str();
        let bkey = binding_key(key);
        let rkey = record_key(share, hash);
        let mut wtxn = self.env.write_txn()?;

        let previous = self.bindings_db.get(&wtxn, &bkey)?;
        let mut prev_record = None;
        if let Some(prev) = &previous {
            let prev_hash = BlockHash(prev.hash);
            if prev_hash == *hash {
                let rec = self.records_db.get(&wtxn, &rkey)?.ok_or_else(|| {
                    inconsistent(format!("binding of {key} points at missing record {hash}"))
                })?;
                return Ok(BindOutcome {
                    unchanged: true,
                    created: false,
                    refs: rec.refs,
                    released: None,
                });
            }
            prev_record = Some((prev_hash, self.releasable(&wtxn, share, &prev_hash)?));
        }

        let (created, record) = match self.records_db.get(&wtxn, &rkey)? {
            Some(mut rec) => {
                rec.refs += 1;
                (false, rec)
            }
            None => (
                true,
                StoredRecord {
                    location: content_location(share, hash),
                    size,
                    refs: 1,
                },
            ),
        };
        self.records_db.put(&mut wtxn, &rkey, &record)?;

        let released = match prev_record {
            Some((prev_hash, rec)) => Some(self.release(&mut wtxn, share, prev_hash, rec)?),
            None => None,
        };

        self.bindings_db.put(
            &mut wtxn,
            &bkey,
            &StoredBinding {
                hash: hash.0,
                size,
            },
        )?;
        wtxn.commit()?;

        log_dedup_debug!(key = %key, hash = %hash, refs = record.refs, created, "bound");
        Ok(BindOutcome {
            unchanged: false,
            created,
            refs: record.refs,
            released,
        })
    }

    fn unbind(&self, key: &BlockKey) -> Result<Option<Released>> {
        let share = key.payload.share.as_str();
        let bkey = binding_key(key);
        let mut wtxn = self.env.write_txn()?;

        let Some(stored) = self.bindings_db.get(&wtxn, &bkey)? else {
            return Ok(None);
        };
        let hash = BlockHash(stored.hash);
        let rec = self.releasable(&wtxn, share, &hash)?;
        self.bindings_db.delete(&mut wtxn, &bkey)?;
        let released = self.release(&mut wtxn, share, hash, rec)?;
        wtxn.commit()?;
        Ok(Some(released))
    }

    fn unbind_from(&self, payload: &PayloadId, chunk: u64, block: u64) -> Result<Vec<Released>> {
        let share = payload.share.as_str();
        let mut wtxn = self.env.write_txn()?;

        let doomed: Vec<(BlockKey, StoredBinding)> = self
            .payload_bindings(&wtxn, payload)?
            .into_iter()
            .filter(|(k, _)| (k.chunk, k.block) >= (chunk, block))
            .collect();

        // Validate the whole batch before touching anything.
        let mut counts: HashMap<[u8; 32], u64> = HashMap::new();
        for (_, stored) in &doomed {
            *counts.entry(stored.hash).or_default() += 1;
        }
        let mut records: HashMap<[u8; 32], StoredRecord> = HashMap::new();
        for (raw_hash, count) in counts {
            let hash = BlockHash(raw_hash);
            let rec = self.records_db.get(&wtxn, &record_key(share, &hash))?;
            let refs = rec.as_ref().map(|r| r.refs).unwrap_or(0);
            match rec {
                Some(rec) if refs >= count => {
                    records.insert(raw_hash, rec);
                }
                _ => {
                    // Dropping wtxn aborts the transaction
                    return Err(inconsistent(format!(
                        "unbinding {payload} would drive {share}/{hash} below zero ({refs} < {count})"
                    )));
                }
            }
        }

        let mut released = Vec::with_capacity(doomed.len());
        for (key, stored) in &doomed {
            self.bindings_db.delete(&mut wtxn, &binding_key(key))?;
            if let Some(rec) = records.get_mut(&stored.hash) {
                rec.refs -= 1;
                released.push(Released {
                    share: share.to_string(),
                    hash: BlockHash(stored.hash),
                    remaining: rec.refs,
                });
            }
        }
        for (raw_hash, rec) in &records {
            self.records_db
                .put(&mut wtxn, &record_key(share, &BlockHash(*raw_hash)), rec)?;
        }
        wtxn.commit()?;
        Ok(released)
    }

    fn binding(&self, key: &BlockKey) -> Result<Option<BlockBinding>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .bindings_db
            .get(&rtxn, &binding_key(key))?
            .map(|stored| Self::to_binding(&key.payload.share, &stored)))
    }

    fn bindings(&self, payload: &PayloadId) -> Result<Vec<(BlockKey, BlockBinding)>> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .payload_bindings(&rtxn, payload)?
            .into_iter()
            .map(|(k, stored)| {
                let binding = Self::to_binding(&payload.share, &stored);
                (k, binding)
            })
            .collect())
    }

    fn has_bindings(&self, payload: &PayloadId) -> Result<bool> {
        let rtxn = self.env.read_txn()?;
        let prefix = payload_prefix(payload);
        let mut iter = self.bindings_db.prefix_iter(&rtxn, &prefix)?;
        Ok(iter.next().transpose()?.is_some())
    }

    fn orphans(&self) -> Result<Vec<DedupRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.records_db.iter(&rtxn)? {
            let (raw, rec) = item?;
            if rec.refs == 0 {
                let (share, hash) = split_record_key(raw)?;
                out.push(Self::to_record(&share, hash, rec));
            }
        }
        Ok(out)
    }

    fn remove_orphan(&self, share: &str, hash: &BlockHash) -> Result<bool> {
        let rkey = record_key(share, hash);
        let mut wtxn = self.env.write_txn()?;
        match self.records_db.get(&wtxn, &rkey)? {
            Some(rec) if rec.refs == 0 => {
                self.records_db.delete(&mut wtxn, &rkey)?;
                wtxn.commit()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn records(&self, share: &str) -> Result<Vec<DedupRecord>> {
        let rtxn = self.env.read_txn()?;
        let mut prefix = share.as_bytes().to_vec();
        prefix.push(0);
        let mut out = Vec::new();
        for item in self.records_db.prefix_iter(&rtxn, &prefix)? {
            let (raw, rec) = item?;
            let (share, hash) = split_record_key(raw)?;
            out.push(Self::to_record(&share, hash, rec));
        }
        Ok(out)
    }

    fn shares(&self) -> Result<Vec<String>> {
        let rtxn = self.env.read_txn()?;
        let mut shares: Vec<String> = Vec::new();
        for item in self.records_db.iter(&rtxn)? {
            let (raw, _) = item?;
            let (share, _) = split_record_key(raw)?;
            if shares.last() != Some(&share) {
                shares.push(share);
            }
        }
        Ok(shares)
    }

    fn stats(&self) -> Result<DedupStats> {
        let rtxn = self.env.read_txn()?;
        let mut stats = DedupStats::default();
        for item in self.records_db.iter(&rtxn)? {
            let (_, rec) = item?;
            stats.records += 1;
            stats.physical_bytes += rec.size;
            if rec.refs == 0 {
                stats.orphans += 1;
            }
        }
        for item in self.bindings_db.iter(&rtxn)? {
            let (_, stored) = item?;
            stats.bindings += 1;
            stats.logical_bytes += stored.size;
        }
        Ok(stats)
    }

    fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}
