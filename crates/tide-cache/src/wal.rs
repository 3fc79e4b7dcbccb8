//! Write-ahead log: one memory-mapped file per cache instance.
//!
//! ```text
//! +--------------------+ 0
//! | header (64 bytes)  |  magic, version, block size, base lsn, crc32
//! +--------------------+ 64
//! | record             |  48-byte record header + share + id + data,
//! | record             |  padded to 8 bytes
//! | ...                |
//! +--------------------+ tail
//! | zeroes             |
//! +--------------------+ capacity
//! ```
//!
//! Records are appended and flushed before the write that produced them is
//! acknowledged. Replay walks forward from the header and stops at the
//! first record whose magic or CRC does not check out, which is where a
//! torn append ends. When the file is full it is compacted: the log is
//! replayed, blocks already uploaded are dropped, and the remaining state is
//! written to a fresh file that atomically replaces the old one.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tide_config::{log_wal_debug, log_wal_info, log_wal_warn};
use tide_store::PayloadId;

use crate::coverage::Coverage;
use crate::{CacheError, Result};

const WAL_MAGIC: [u8; 8] = *b"TIDEWAL\0";
const WAL_VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 64;
const HEADER_CRC_SPAN: usize = 32;

const RECORD_MAGIC: u32 = 0x5444_5752;
const RECORD_HEADER_SIZE: usize = 48;
const RECORD_CRC_SPAN: usize = 40;

const FLAG_AUTH: u8 = 0x01;

const KIND_WRITE: u8 = 1;
const KIND_TRUNCATE: u8 = 2;
const KIND_DELETE: u8 = 3;
const KIND_UPLOADED: u8 = 4;

/// One logged mutation.
#[derive(Debug, Clone, Copy)]
pub enum WalOp<'a> {
    /// Bytes written at `offset` inside the block. `auth` replaces the block
    /// with exactly these bytes and marks uncovered bytes as zeros.
    Write {
        auth: bool,
        offset: u64,
        data: &'a [u8],
    },
    /// Payload cut to `size` bytes.
    Truncate { size: u64 },
    /// Payload dropped.
    Delete,
    /// Block content up to write sequence `seq` is durable.
    Uploaded { seq: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct WalRecord<'a> {
    pub payload: &'a PayloadId,
    pub block: u64,
    pub op: WalOp<'a>,
}

impl WalRecord<'_> {
    fn body_len(&self) -> usize {
        let data = match self.op {
            WalOp::Write { data, .. } => data.len(),
            _ => 0,
        };
        self.payload.share.len() + self.payload.id.len() + data
    }

    pub fn encoded_len(&self) -> usize {
        align8(RECORD_HEADER_SIZE + self.body_len())
    }
}

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

impl WalRecord<'_> {
    fn parts(&self) -> (u8, u8, u64, &[u8]) {
        match self.op {
            WalOp::Write { auth, offset, data } => {
                (KIND_WRITE, if auth { FLAG_AUTH } else { 0 }, offset, data)
            }
            WalOp::Truncate { size } => (KIND_TRUNCATE, 0, size, &[]),
            WalOp::Delete => (KIND_DELETE, 0, 0, &[]),
            WalOp::Uploaded { seq } => (KIND_UPLOADED, 0, seq, &[]),
        }
    }

    /// Field widths of the record header: u16 share and id, u32 data.
    fn field_lens(&self) -> Result<(u16, u16, u32)> {
        let share = u16::try_from(self.payload.share.len());
        let id = u16::try_from(self.payload.id.len());
        let data = u32::try_from(self.parts().3.len());
        match (share, id, data) {
            (Ok(share), Ok(id), Ok(data)) => Ok((share, id, data)),
            _ => Err(CacheError::Wal(format!(
                "record for {} block {} does not fit the WAL record header",
                self.payload, self.block
            ))),
        }
    }
}

/// Encode `rec` into the front of `dst`, returning the bytes used.
fn write_record(dst: &mut [u8], rec: &WalRecord<'_>, lsn: u64) -> Result<usize> {
    let (share_len, id_len, data_len) = rec.field_lens()?;
    let (kind, flags, arg, data) = rec.parts();
    let share = rec.payload.share.as_bytes();
    let id = rec.payload.id.as_bytes();
    let total = rec.encoded_len();
    let dst = &mut dst[..total];

    dst[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    dst[4] = kind;
    dst[5] = flags;
    dst[6..8].fill(0);
    dst[8..16].copy_from_slice(&lsn.to_le_bytes());
    dst[16..24].copy_from_slice(&rec.block.to_le_bytes());
    dst[24..32].copy_from_slice(&arg.to_le_bytes());
    dst[32..34].copy_from_slice(&share_len.to_le_bytes());
    dst[34..36].copy_from_slice(&id_len.to_le_bytes());
    dst[36..40].copy_from_slice(&data_len.to_le_bytes());
    dst[44..48].fill(0);

    let mut pos = RECORD_HEADER_SIZE;
    for part in [share, id, data] {
        dst[pos..pos + part.len()].copy_from_slice(part);
        pos += part.len();
    }
    dst[pos..total].fill(0);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&dst[..RECORD_CRC_SPAN]);
    hasher.update(&dst[RECORD_HEADER_SIZE..pos]);
    dst[40..44].copy_from_slice(&hasher.finalize().to_le_bytes());
    Ok(total)
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

struct Decoded<'a> {
    kind: u8,
    flags: u8,
    lsn: u64,
    block: u64,
    arg: u64,
    share: &'a str,
    id: &'a str,
    data: &'a [u8],
    next: usize,
}

/// Decode the record at `pos`, or `None` at the end of the valid log.
fn decode(buf: &[u8], pos: usize) -> Option<Decoded<'_>> {
    let header = buf.get(pos..pos + RECORD_HEADER_SIZE)?;
    if read_u32(header, 0) != RECORD_MAGIC {
        return None;
    }
    let share_len = read_u16(header, 32) as usize;
    let id_len = read_u16(header, 34) as usize;
    let data_len = read_u32(header, 36) as usize;
    let body_start = pos + RECORD_HEADER_SIZE;
    let body_end = body_start + share_len + id_len + data_len;
    let body = buf.get(body_start..body_end)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..RECORD_CRC_SPAN]);
    hasher.update(body);
    if hasher.finalize() != read_u32(header, 40) {
        return None;
    }

    let share = std::str::from_utf8(&body[..share_len]).ok()?;
    let id = std::str::from_utf8(&body[share_len..share_len + id_len]).ok()?;
    Some(Decoded {
        kind: header[4],
        flags: header[5],
        lsn: read_u64(header, 8),
        block: read_u64(header, 16),
        arg: read_u64(header, 24),
        share,
        id,
        data: &body[share_len + id_len..],
        next: pos + align8(RECORD_HEADER_SIZE + share_len + id_len + data_len),
    })
}

fn write_header(dst: &mut [u8], block_size: u64, base_lsn: u64) {
    let dst = &mut dst[..HEADER_SIZE];
    dst.fill(0);
    dst[0..8].copy_from_slice(&WAL_MAGIC);
    dst[8..12].copy_from_slice(&WAL_VERSION.to_le_bytes());
    dst[16..24].copy_from_slice(&block_size.to_le_bytes());
    dst[24..32].copy_from_slice(&base_lsn.to_le_bytes());
    let crc = crc32fast::hash(&dst[..HEADER_CRC_SPAN]);
    dst[32..36].copy_from_slice(&crc.to_le_bytes());
}

/// Validate the header, returning `(block_size, base_lsn)`.
fn read_header(buf: &[u8]) -> Result<(u64, u64)> {
    if buf.len() < HEADER_SIZE || buf[0..8] != WAL_MAGIC {
        return Err(CacheError::Wal("invalid WAL magic".to_string()));
    }
    let version = read_u32(buf, 8);
    if version != WAL_VERSION {
        return Err(CacheError::Wal(format!("unsupported WAL version {version}")));
    }
    let stored = read_u32(buf, 32);
    let computed = crc32fast::hash(&buf[..HEADER_CRC_SPAN]);
    if stored != computed {
        return Err(CacheError::Wal(format!(
            "WAL header CRC mismatch (stored {stored:#x}, computed {computed:#x})"
        )));
    }
    Ok((read_u64(buf, 16), read_u64(buf, 24)))
}

/// Dirty block state reconstructed from the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayedBlock {
    pub data: Vec<u8>,
    pub coverage: Coverage,
    /// LSN of the last write
    pub seq: u64,
    pub authoritative: bool,
}

pub type BlockMap = BTreeMap<(PayloadId, u64), ReplayedBlock>;

#[derive(Default)]
struct Replay {
    blocks: BlockMap,
    uploaded: HashMap<(PayloadId, u64), u64>,
    max_lsn: u64,
    records: u64,
    end: usize,
}

impl Replay {
    fn run(buf: &[u8], block_size: u64) -> Self {
        let mut replay = Replay {
            end: HEADER_SIZE,
            ..Default::default()
        };
        let mut pos = HEADER_SIZE;
        while let Some(rec) = decode(buf, pos) {
            replay.apply(&rec, block_size);
            pos = rec.next;
        }
        replay.end = pos;
        replay
    }

    fn keys_of(&self, payload: &PayloadId) -> Vec<(PayloadId, u64)> {
        self.blocks
            .range((payload.clone(), 0)..)
            .take_while(|((p, _), _)| p == payload)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn apply(&mut self, rec: &Decoded<'_>, block_size: u64) {
        self.records += 1;
        self.max_lsn = self.max_lsn.max(rec.lsn);
        let payload = PayloadId::new(rec.share, rec.id);

        match rec.kind {
            KIND_WRITE => {
                let block = self.blocks.entry((payload, rec.block)).or_default();
                if rec.flags & FLAG_AUTH != 0 {
                    block.data = rec.data.to_vec();
                    block.coverage = Coverage::full(rec.data.len() as u64);
                    block.authoritative = true;
                } else {
                    let start = rec.arg as usize;
                    let end = start + rec.data.len();
                    if block.data.len() < end {
                        block.data.resize(end, 0);
                    }
                    block.data[start..end].copy_from_slice(rec.data);
                    block.coverage.insert(start as u64, end as u64);
                }
                block.seq = rec.lsn;
            }
            KIND_TRUNCATE => {
                let size = rec.arg;
                let cut = size / block_size;
                let rem = size % block_size;
                for key in self.keys_of(&payload) {
                    let idx = key.1;
                    if idx > cut || (idx == cut && rem == 0) {
                        self.blocks.remove(&key);
                    } else if idx == cut {
                        if let Some(block) = self.blocks.get_mut(&key) {
                            block.data.truncate(rem as usize);
                            block.coverage.truncate(rem);
                        }
                    }
                }
            }
            KIND_DELETE => {
                for key in self.keys_of(&payload) {
                    self.blocks.remove(&key);
                }
                self.uploaded.retain(|(p, _), _| p != &payload);
            }
            KIND_UPLOADED => {
                let seen = self.uploaded.entry((payload, rec.block)).or_default();
                *seen = (*seen).max(rec.arg);
            }
            other => {
                log_wal_warn!(kind = other, lsn = rec.lsn, "skipping unknown WAL record kind");
            }
        }
    }

    /// Blocks written after their last upload marker.
    fn live(self) -> BlockMap {
        let uploaded = self.uploaded;
        self.blocks
            .into_iter()
            .filter(|(key, block)| block.seq > uploaded.get(key).copied().unwrap_or(0))
            .collect()
    }
}

/// Records that reproduce `blocks` exactly, each stamped with its block's sequence.
fn live_records(blocks: &BlockMap) -> Vec<(WalRecord<'_>, u64)> {
    let mut out = Vec::new();
    for ((payload, index), block) in blocks {
        if block.authoritative {
            out.push((
                WalRecord {
                    payload,
                    block: *index,
                    op: WalOp::Write {
                        auth: true,
                        offset: 0,
                        data: &block.data,
                    },
                },
                block.seq,
            ));
        } else {
            for &(l, r) in block.coverage.ranges() {
                out.push((
                    WalRecord {
                        payload,
                        block: *index,
                        op: WalOp::Write {
                            auth: false,
                            offset: l,
                            data: &block.data[l as usize..r as usize],
                        },
                    },
                    block.seq,
                ));
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    pub block_size: u64,
    pub initial_size: u64,
    pub max_size: u64,
    pub compact_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalUsage {
    pub capacity: u64,
    pub used: u64,
}

/// Summary of a log inspected without opening it for writing.
#[derive(Debug, Clone)]
pub struct WalReport {
    pub capacity: u64,
    pub used: u64,
    pub records: u64,
    pub next_lsn: u64,
    /// Blocks that would be recovered as pending: (payload, block, length, seq)
    pub pending: Vec<(PayloadId, u64, u64, u64)>,
}

pub struct Wal {
    path: PathBuf,
    mmap: MmapMut,
    capacity: u64,
    tail: u64,
    /// Everything before this offset has been flushed
    synced: u64,
    next_lsn: u64,
    opts: WalOptions,
}

impl Wal {
    /// Open or create the log at `path` and replay it.
    pub fn open(path: &Path, opts: WalOptions) -> Result<(Self, BlockMap)> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let fresh = len == 0;
        if fresh {
            file.set_len(opts.initial_size.max(HEADER_SIZE as u64))?;
        } else if len < HEADER_SIZE as u64 {
            return Err(CacheError::Wal(format!("WAL file too short: {len} bytes")));
        }

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let capacity = mmap.len() as u64;

        let base_lsn = if fresh {
            write_header(&mut mmap, opts.block_size, 1);
            mmap.flush_range(0, HEADER_SIZE)?;
            log_wal_info!(path = %path.display(), size = capacity, "Created new WAL file");
            1
        } else {
            let (block_size, base_lsn) = read_header(&mmap)?;
            if block_size != opts.block_size {
                return Err(CacheError::LayoutMismatch {
                    wal: block_size,
                    configured: opts.block_size,
                });
            }
            base_lsn
        };

        let replay = Replay::run(&mmap, opts.block_size);
        let tail = replay.end as u64;
        let next_lsn = base_lsn.max(replay.max_lsn + 1);
        log_wal_debug!(
            records = replay.records,
            tail,
            next_lsn,
            "WAL replayed"
        );

        let wal = Self {
            path: path.to_path_buf(),
            mmap,
            capacity,
            tail,
            synced: tail,
            next_lsn,
            opts,
        };
        Ok((wal, replay.live()))
    }

    /// Read-only view of a log, for diagnostics.
    pub fn inspect(path: &Path) -> Result<WalReport> {
        let buf = std::fs::read(path)?;
        let (block_size, base_lsn) = read_header(&buf)?;
        let replay = Replay::run(&buf, block_size);
        let used = replay.end as u64;
        let records = replay.records;
        let next_lsn = base_lsn.max(replay.max_lsn + 1);
        let pending = replay
            .live()
            .into_iter()
            .map(|((p, b), block)| (p, b, block.data.len() as u64, block.seq))
            .collect();
        Ok(WalReport {
            capacity: buf.len() as u64,
            used,
            records,
            next_lsn,
            pending,
        })
    }

    pub fn usage(&self) -> WalUsage {
        WalUsage {
            capacity: self.capacity,
            used: self.tail,
        }
    }

    /// Append `records` as one unit and flush them. Either every record is
    /// logged or none is. Returns one LSN per record.
    pub fn append_batch(&mut self, records: &[WalRecord<'_>]) -> Result<Vec<u64>> {
        for rec in records {
            rec.field_lens()?;
        }
        let need: u64 = records.iter().map(|r| r.encoded_len() as u64).sum();
        if self.tail + need > self.capacity {
            self.make_room(need)?;
        }

        let mut lsns = Vec::with_capacity(records.len());
        for rec in records {
            let lsn = self.next_lsn;
            self.next_lsn += 1;
            let start = self.tail as usize;
            let used = write_record(&mut self.mmap[start..], rec, lsn)?;
            self.tail += used as u64;
            lsns.push(lsn);
        }
        self.sync()?;
        Ok(lsns)
    }

    pub fn sync(&mut self) -> Result<()> {
        if self.tail > self.synced {
            self.mmap
                .flush_range(self.synced as usize, (self.tail - self.synced) as usize)?;
            self.synced = self.tail;
        }
        Ok(())
    }

    /// Compact, then grow if the live set still fills too much of the file.
    fn make_room(&mut self, need: u64) -> Result<()> {
        let live = Replay::run(&self.mmap[..self.tail as usize], self.opts.block_size).live();
        let records = live_records(&live);

        let body_len: usize = records.iter().map(|(r, _)| r.encoded_len()).sum();
        let used = (HEADER_SIZE + body_len) as u64;

        let mut capacity = self.capacity;
        while capacity < self.opts.max_size
            && (used + need > capacity
                || used as f64 > capacity as f64 * self.opts.compact_ratio)
        {
            capacity = (capacity * 2).min(self.opts.max_size);
        }
        if used + need > capacity {
            return Err(CacheError::WalFull {
                needed: used + need,
                max: self.opts.max_size,
            });
        }

        let mut image = vec![0u8; HEADER_SIZE + body_len];
        write_header(&mut image, self.opts.block_size, self.next_lsn);
        let mut pos = HEADER_SIZE;
        for (rec, lsn) in &records {
            pos += write_record(&mut image[pos..], rec, *lsn)?;
        }

        let before = self.tail;
        self.rewrite(&image, capacity)?;
        log_wal_info!(
            before,
            after = used,
            capacity,
            live_blocks = live.len(),
            "WAL compacted"
        );
        Ok(())
    }

    /// Replace the log with `image` in a file of `capacity` bytes.
    fn rewrite(&mut self, image: &[u8], capacity: u64) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".compact");
        let tmp = PathBuf::from(tmp_name);

        {
            let mut file = File::create(&tmp)?;
            file.write_all(image)?;
            file.set_len(capacity)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.mmap = unsafe { MmapMut::map_mut(&file)? };
        self.capacity = capacity;
        self.tail = image.len() as u64;
        self.synced = self.tail;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BS: u64 = 4096;

    fn opts(initial: u64, max: u64) -> WalOptions {
        WalOptions {
            block_size: BS,
            initial_size: initial,
            max_size: max,
            compact_ratio: 0.5,
        }
    }

    fn write<'a>(p: &'a PayloadId, block: u64, offset: u64, data: &'a [u8]) -> WalRecord<'a> {
        WalRecord {
            payload: p,
            block,
            op: WalOp::Write {
                auth: false,
                offset,
                data,
            },
        }
    }

    #[test]
    fn test_replay_after_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        {
            let (mut wal, live) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
            assert!(live.is_empty());
            wal.append_batch(&[write(&p, 0, 10, b"hello"), write(&p, 1, 0, b"world")])
                .unwrap();
        }
        let (wal, live) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
        assert_eq!(live.len(), 2);
        let b0 = &live[&(p.clone(), 0)];
        assert_eq!(&b0.data[10..15], b"hello");
        assert_eq!(b0.coverage.ranges(), &[(10, 15)]);
        assert!(!b0.authoritative);
        assert!(wal.next_lsn > b0.seq);
    }

    #[test]
    fn test_uploaded_marker_hides_block() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        {
            let (mut wal, _) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
            let lsns = wal.append_batch(&[write(&p, 0, 0, b"abc")]).unwrap();
            wal.append_batch(&[WalRecord {
                payload: &p,
                block: 0,
                op: WalOp::Uploaded { seq: lsns[0] },
            }])
            .unwrap();
            // Later write makes it live again
            wal.append_batch(&[write(&p, 1, 0, b"x")]).unwrap();
        }
        let (_, live) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
        assert_eq!(live.keys().cloned().collect::<Vec<_>>(), vec![(p, 1)]);
    }

    #[test]
    fn test_truncate_and_delete_replay() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        let q = PayloadId::new("s", "g");
        {
            let (mut wal, _) = Wal::open(&path, opts(256 * 1024, 1 << 20)).unwrap();
            let full = vec![1u8; BS as usize];
            wal.append_batch(&[
                write(&p, 0, 0, &full),
                write(&p, 1, 0, &full),
                write(&p, 2, 0, &full),
                write(&q, 0, 0, b"gone"),
            ])
            .unwrap();
            wal.append_batch(&[
                WalRecord {
                    payload: &p,
                    block: 1,
                    op: WalOp::Write {
                        auth: true,
                        offset: 0,
                        data: &full[..100],
                    },
                },
                WalRecord {
                    payload: &p,
                    block: 1,
                    op: WalOp::Truncate { size: BS + 100 },
                },
                WalRecord {
                    payload: &q,
                    block: 0,
                    op: WalOp::Delete,
                },
            ])
            .unwrap();
        }
        let (_, live) = Wal::open(&path, opts(256 * 1024, 1 << 20)).unwrap();
        assert_eq!(live.len(), 2);
        let cut = &live[&(p.clone(), 1)];
        assert!(cut.authoritative);
        assert_eq!(cut.data.len(), 100);
        assert!(!live.contains_key(&(p, 2)));
        assert!(!live.contains_key(&(q, 0)));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        let tail_before;
        {
            let (mut wal, _) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
            wal.append_batch(&[write(&p, 0, 0, b"keep")]).unwrap();
            tail_before = wal.tail as usize;
            wal.append_batch(&[write(&p, 1, 0, b"torn")]).unwrap();
            // Flip a data byte of the second record
            let at = tail_before + RECORD_HEADER_SIZE + 2;
            wal.mmap[at] ^= 0xff;
            wal.mmap.flush().unwrap();
        }
        let (wal, live) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(wal.tail as usize, tail_before);
    }

    #[test]
    fn test_compaction_drops_uploaded_blocks() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        let data = vec![9u8; 2000];

        let (mut wal, _) = Wal::open(&path, opts(16 * 1024, 16 * 1024)).unwrap();
        // Fill and mark uploaded many times; without compaction this overflows
        for round in 0..40u64 {
            let lsns = wal.append_batch(&[write(&p, round % 3, 0, &data)]).unwrap();
            wal.append_batch(&[WalRecord {
                payload: &p,
                block: round % 3,
                op: WalOp::Uploaded { seq: lsns[0] },
            }])
            .unwrap();
        }
        wal.append_batch(&[write(&p, 7, 5, b"live")]).unwrap();
        assert!(wal.usage().used < 16 * 1024);
        drop(wal);

        let (_, live) = Wal::open(&path, opts(16 * 1024, 16 * 1024)).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(&live[&(p, 7)].data[5..9], b"live");
    }

    #[test]
    fn test_grows_then_fails_at_max() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        let data = vec![1u8; 3000];

        let (mut wal, _) = Wal::open(&path, opts(8 * 1024, 32 * 1024)).unwrap();
        let mut block = 0;
        let err = loop {
            match wal.append_batch(&[write(&p, block, 0, &data)]) {
                Ok(_) => block += 1,
                Err(e) => break e,
            }
            assert!(block < 100, "WAL never filled up");
        };
        assert!(matches!(err, CacheError::WalFull { .. }));
        assert_eq!(wal.usage().capacity, 32 * 1024);
        assert!(block >= 8);
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        drop(Wal::open(&path, opts(8 * 1024, 8 * 1024)).unwrap());
        let mut other = opts(8 * 1024, 8 * 1024);
        other.block_size = 8192;
        assert!(matches!(
            Wal::open(&path, other),
            Err(CacheError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_inspect_reports_pending() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let p = PayloadId::new("s", "f");
        {
            let (mut wal, _) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
            wal.append_batch(&[write(&p, 3, 0, &[5u8; 64])]).unwrap();
        }
        let report = Wal::inspect(&path).unwrap();
        assert_eq!(report.records, 1);
        assert_eq!(report.pending.len(), 1);
        assert_eq!(report.pending[0].1, 3);
        assert_eq!(report.pending[0].2, 64);
    }

    #[test]
    fn test_oversized_id_rejected_without_touching_log() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.wal");
        let long = PayloadId::new("s", "x".repeat(70_000));
        let short = PayloadId::new("s", "after");
        {
            let (mut wal, _) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
            wal.append_batch(&[write(&short, 0, 0, b"before")]).unwrap();
            let tail = wal.usage().used;
            let err = wal
                .append_batch(&[write(&short, 1, 0, b"x"), write(&long, 0, 0, b"y")])
                .unwrap_err();
            assert!(matches!(err, CacheError::Wal(_)));
            assert_eq!(wal.usage().used, tail);
            wal.append_batch(&[write(&short, 2, 0, b"later")]).unwrap();
        }
        let (_, live) = Wal::open(&path, opts(64 * 1024, 1 << 20)).unwrap();
        let blocks: Vec<u64> = live.keys().map(|(_, b)| *b).collect();
        assert_eq!(blocks, vec![0, 2]);
    }
}
