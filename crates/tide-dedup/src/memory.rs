//! In-memory dedup index. One mutex guards records and bindings together,
//! so every call is a single check-and-set.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tide_config::log_dedup_debug;
use tide_store::{content_location, BlockHash, BlockKey, PayloadId};

use crate::{
    inconsistent, BindOutcome, BlockBinding, DedupError, DedupIndex, DedupRecord, DedupStats,
    Released, Result,
};

#[derive(Debug, Clone)]
struct RecordState {
    location: String,
    size: u64,
    refs: u64,
}

#[derive(Default)]
struct Inner {
    records: HashMap<(String, BlockHash), RecordState>,
    bindings: BTreeMap<BlockKey, BlockBinding>,
}

impl Inner {
    /// Check that releasing `binding` of `share` is legal without mutating anything.
    fn check_release(&self, share: &str, binding: &BlockBinding) -> Result<()> {
        match self.records.get(&(share.to_string(), binding.hash)) {
            None => Err(inconsistent(format!(
                "binding points at missing record {share}/{}",
                binding.hash
            ))),
            Some(rec) if rec.refs == 0 => Err(inconsistent(format!(
                "refcount of {share}/{} would go negative",
                binding.hash
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Caller must have run `check_release` first.
    fn release(&mut self, share: &str, hash: BlockHash) -> Released {
        let mut remaining = 0;
        if let Some(rec) = self.records.get_mut(&(share.to_string(), hash)) {
            rec.refs -= 1;
            remaining = rec.refs;
        }
        Released {
            share: share.to_string(),
            hash,
            remaining,
        }
    }

    fn record(&self, share: &str, hash: &BlockHash, state: &RecordState) -> DedupRecord {
        DedupRecord {
            share: share.to_string(),
            hash: *hash,
            location: state.location.clone(),
            size: state.size,
            refs: state.refs,
        }
    }

    fn payload_keys(&self, payload: &PayloadId, chunk: u64, block: u64) -> Vec<BlockKey> {
        let start = BlockKey {
            payload: payload.clone(),
            chunk,
            block,
        };
        self.bindings
            .range(start..)
            .take_while(|(k, _)| &k.payload == payload)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryDedupIndex {
    inner: Mutex<Inner>,
}

impl MemoryDedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| DedupError::Corrupted("index mutex poisoned".to_string()))
    }
}

impl DedupIndex for MemoryDedupIndex {
    fn lookup(&self, share: &str, hash: &BlockHash) -> Result<Option<DedupRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .get(&(share.to_string(), *hash))
            .map(|state| inner.record(share, hash, state)))
    }

    fn bind(&self, key: &BlockKey, hash: &BlockHash, size: u64) -> Result<BindOutcome> {
        let mut inner = self.lock()?;
        let share = key.payload.share.clone();
        let previous = inner.bindings.get(key).cloned();

        if let Some(prev) = &previous {
            if prev.hash == *hash {
                let refs = inner
                    .records
                    .get(&(share.clone(), *hash))
                    .map(|r| r.refs)
                    .ok_or_else(|| {
                        inconsistent(format!("binding of {key} points at missing record {hash}"))
                    })?;
                return Ok(BindOutcome {
                    unchanged: true,
                    created: false,
                    refs,
                    released: None,
                });
            }
            inner.check_release(&share, prev)?;
        }

        let location = content_location(&share, hash);
        let (created, refs) = {
            let rec_key = (share.clone(), *hash);
            match inner.records.get_mut(&rec_key) {
                Some(rec) => {
                    rec.refs += 1;
                    (false, rec.refs)
                }
                None => {
                    inner.records.insert(
                        rec_key,
                        RecordState {
                            location: location.clone(),
                            size,
                            refs: 1,
                        },
                    );
                    (true, 1)
                }
            }
        };

        let released = previous.map(|prev| inner.release(&share, prev.hash));
        inner.bindings.insert(
            key.clone(),
            BlockBinding {
                hash: *hash,
                location,
                size,
            },
        );

        log_dedup_debug!(key = %key, hash = %hash, refs, created, "bound");
        Ok(BindOutcome {
            unchanged: false,
            created,
            refs,
            released,
        })
    }

    fn unbind(&self, key: &BlockKey) -> Result<Option<Released>> {
        let mut inner = self.lock()?;
        let Some(binding) = inner.bindings.get(key).cloned() else {
            return Ok(None);
        };
        inner.check_release(&key.payload.share, &binding)?;
        inner.bindings.remove(key);
        Ok(Some(inner.release(&key.payload.share, binding.hash)))
    }

    fn unbind_from(&self, payload: &PayloadId, chunk: u64, block: u64) -> Result<Vec<Released>> {
        let mut inner = self.lock()?;
        let keys = inner.payload_keys(payload, chunk, block);

        // Validate the whole batch first, counting repeated hashes.
        let mut pending: HashMap<BlockHash, u64> = HashMap::new();
        for key in &keys {
            if let Some(b) = inner.bindings.get(key) {
                *pending.entry(b.hash).or_default() += 1;
            }
        }
        for (hash, count) in &pending {
            let refs = inner
                .records
                .get(&(payload.share.clone(), *hash))
                .map(|r| r.refs)
                .unwrap_or(0);
            if refs < *count {
                return Err(inconsistent(format!(
                    "unbinding {payload} would drive {}/{hash} below zero ({refs} < {count})",
                    payload.share
                )));
            }
        }

        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(binding) = inner.bindings.remove(&key) {
                released.push(inner.release(&payload.share, binding.hash));
            }
        }
        Ok(released)
    }

    fn binding(&self, key: &BlockKey) -> Result<Option<BlockBinding>> {
        Ok(self.lock()?.bindings.get(key).cloned())
    }

    fn bindings(&self, payload: &PayloadId) -> Result<Vec<(BlockKey, BlockBinding)>> {
        let inner = self.lock()?;
        Ok(inner
            .payload_keys(payload, 0, 0)
            .into_iter()
            .filter_map(|k| inner.bindings.get(&k).cloned().map(|b| (k, b)))
            .collect())
    }

    fn has_bindings(&self, payload: &PayloadId) -> Result<bool> {
        let inner = self.lock()?;
        let start = BlockKey {
            payload: payload.clone(),
            chunk: 0,
            block: 0,
        };
        Ok(inner
            .bindings
            .range(start..)
            .next()
            .is_some_and(|(k, _)| &k.payload == payload))
    }

    fn orphans(&self) -> Result<Vec<DedupRecord>> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .iter()
            .filter(|(_, s)| s.refs == 0)
            .map(|((share, hash), s)| inner.record(share, hash, s))
            .collect())
    }

    fn remove_orphan(&self, share: &str, hash: &BlockHash) -> Result<bool> {
        let mut inner = self.lock()?;
        let rec_key = (share.to_string(), *hash);
        match inner.records.get(&rec_key) {
            Some(rec) if rec.refs == 0 => {
                inner.records.remove(&rec_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn records(&self, share: &str) -> Result<Vec<DedupRecord>> {
        let inner = self.lock()?;
        let mut out: Vec<DedupRecord> = inner
            .records
            .iter()
            .filter(|((s, _), _)| s == share)
            .map(|((s, h), state)| inner.record(s, h, state))
            .collect();
        out.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(out)
    }

    fn shares(&self) -> Result<Vec<String>> {
        let inner = self.lock()?;
        let mut shares: Vec<String> = inner.records.keys().map(|(s, _)| s.clone()).collect();
        shares.sort();
        shares.dedup();
        Ok(shares)
    }

    fn stats(&self) -> Result<DedupStats> {
        let inner = self.lock()?;
        let mut stats = DedupStats {
            records: inner.records.len() as u64,
            bindings: inner.bindings.len() as u64,
            ..Default::default()
        };
        for rec in inner.records.values() {
            stats.physical_bytes += rec.size;
            if rec.refs == 0 {
                stats.orphans += 1;
            }
        }
        stats.logical_bytes = inner.bindings.values().map(|b| b.size).sum();
        Ok(stats)
    }
}
