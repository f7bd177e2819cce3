//! Codecs for the records persisted by the storage layer.
//!
//! Both record kinds carry the path of the node they describe, which is what lets the
//! validators cross-check every index entry against the record it points at. Layouts
//! are little-endian and versioned with a leading byte.

use crate::hasher::{Hash, TreeHasher, HASH_SIZE};
use core::fmt;

const LEAF_RECORD_VERSION: u8 = 1;
const HASH_RECORD_VERSION: u8 = 1;

/// An error decoding a serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the full record was read.
    UnexpectedEnd,
    /// The version byte was not one this build understands.
    UnknownVersion(u8),
    /// A length field was inconsistent with the input size.
    InvalidLength,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnexpectedEnd => write!(f, "record truncated"),
            CodecError::UnknownVersion(v) => write!(f, "unknown record version {}", v),
            CodecError::InvalidLength => write!(f, "inconsistent record length"),
        }
    }
}

impl std::error::Error for CodecError {}

/// A serialized leaf: the node path together with the raw key and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualLeafBytes {
    pub path: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl VirtualLeafBytes {
    pub fn new(path: i64, key: Vec<u8>, value: Vec<u8>) -> Self {
        VirtualLeafBytes { path, key, value }
    }

    /// The hash of this leaf under the given hasher.
    pub fn hash<H: TreeHasher>(&self) -> Hash {
        H::hash_leaf(self.path, &self.key, &self.value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + 4 + self.key.len() + 4 + self.value.len());
        out.push(LEAF_RECORD_VERSION);
        out.extend_from_slice(&self.path.to_le_bytes());
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.value);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let version = r.read_u8()?;
        if version != LEAF_RECORD_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        let path = r.read_i64()?;
        let key = r.read_var_bytes()?;
        let value = r.read_var_bytes()?;
        if !r.is_empty() {
            return Err(CodecError::InvalidLength);
        }
        Ok(VirtualLeafBytes { path, key, value })
    }
}

/// A serialized single-node hash: `(path, hash)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualHashRecord {
    pub path: i64,
    pub hash: Hash,
}

impl VirtualHashRecord {
    pub fn new(path: i64, hash: Hash) -> Self {
        VirtualHashRecord { path, hash }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 8 + HASH_SIZE);
        out.push(HASH_RECORD_VERSION);
        out.extend_from_slice(&self.path.to_le_bytes());
        out.extend_from_slice(&self.hash);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let version = r.read_u8()?;
        if version != HASH_RECORD_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        let path = r.read_i64()?;
        let hash = r.read_hash()?;
        if !r.is_empty() {
            return Err(CodecError::InvalidLength);
        }
        Ok(VirtualHashRecord { path, hash })
    }
}

impl fmt::Display for VirtualHashRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", hex::encode(&self.hash[..8]), self.path)
    }
}

/// A cursor over a byte slice used by the record decoders.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.data.len() < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, CodecError> {
        // UNWRAP: take() returned exactly 4 bytes.
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64, CodecError> {
        // UNWRAP: take() returned exactly 8 bytes.
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub(crate) fn read_hash(&mut self) -> Result<Hash, CodecError> {
        // UNWRAP: take() returned exactly HASH_SIZE bytes.
        Ok(self.take(HASH_SIZE)?.try_into().unwrap())
    }

    pub(crate) fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
