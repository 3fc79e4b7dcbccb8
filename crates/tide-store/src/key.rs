//! Logical and physical block addressing.
//!
//! Logical identity: `share / payload id / chunk index / block index`.
//! Physical identity: the BLAKE3 hash of the block bytes, stored under a
//! 3-level fan-out below the share:
//!
//! ```text
//! <share>/blocks/ab/cd/abcd1234...ef
//! ```

use std::fmt;

use crate::{Result, StoreError};

/// BLAKE3 digest of one block's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    #[inline]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({}..)", &self.to_hex()[..12])
    }
}

/// One file's content stream, scoped to a share.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId {
    pub share: String,
    pub id: String,
}

impl PayloadId {
    pub fn new(share: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            share: share.into(),
            id: id.into(),
        }
    }

    /// Share and id must be non-empty, at most [`MAX_SEGMENT_LEN`] bytes and
    /// free of `/` and NUL, since both end up as path segments, index key
    /// components and length-prefixed WAL fields.
    pub fn validate(&self) -> Result<()> {
        validate_segment(&self.share)?;
        validate_segment(&self.id)?;
        Ok(())
    }
}

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.share, self.id)
    }
}

/// Longest share or payload id, in bytes.
pub const MAX_SEGMENT_LEN: usize = u16::MAX as usize;

pub(crate) fn validate_segment(s: &str) -> Result<()> {
    if s.is_empty()
        || s.len() > MAX_SEGMENT_LEN
        || s == "."
        || s == ".."
        || s.contains(['/', '\0', '\\'])
    {
        return Err(StoreError::InvalidKey(s.to_string()));
    }
    Ok(())
}

/// Logical block identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub payload: PayloadId,
    pub chunk: u64,
    pub block: u64,
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.payload, self.chunk, self.block)
    }
}

/// Prefix under which all physical blocks of a share live.
pub fn blocks_prefix(share: &str) -> String {
    format!("{share}/blocks/")
}

/// Content-addressed store key for a block of `share`.
pub fn content_location(share: &str, hash: &BlockHash) -> String {
    let hex = hash.to_hex();
    format!("{share}/blocks/{}/{}/{hex}", &hex[..2], &hex[2..4])
}

/// Inverse of [`content_location`]. Returns `None` for keys outside the layout.
pub fn parse_content_location(key: &str) -> Option<(String, BlockHash)> {
    let mut parts = key.split('/');
    let share = parts.next()?;
    if parts.next()? != "blocks" {
        return None;
    }
    let l1 = parts.next()?;
    let l2 = parts.next()?;
    let name = parts.next()?;
    if parts.next().is_some() || share.is_empty() {
        return None;
    }
    let hash = BlockHash::from_hex(name)?;
    if name[..2] != *l1 || name[2..4] != *l2 {
        return None;
    }
    Some((share.to_string(), hash))
}
