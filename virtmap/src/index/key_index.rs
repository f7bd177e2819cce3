//! The key index: a bucketed on-disk hash map from key bytes to leaf path.
//!
//! Keys hash with fxhash64 and land in the bucket at `hash & (bucket_count - 1)`.
//! Buckets are immutable records in an append-only store; the in-memory location
//! array maps bucket slot to the current record.
//!
//! Growth doubles the bucket count by copying the lower half of the location array
//! into the upper half, so a record becomes reachable from two slots. Buckets split
//! lazily: the next write to either slot rewrites the record with only the entries
//! that still belong to that slot under the current mask, while the twin slot keeps
//! reading the shared record. This preserves, at all times,
//! `stored_index & slot == stored_index` and, for every entry,
//! `entry_hash & stored_index == stored_index`.

use crate::store::{DiskLocation, RecordStore};
use anyhow::{bail, ensure, Result};
use std::sync::Arc;

const BUCKET_RECORD_VERSION: u8 = 1;
const MAX_BUCKET_COUNT: usize = 1 << 30;

/// One `key -> path` mapping inside a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub hash: u64,
    pub key: Vec<u8>,
    pub path: i64,
}

/// A decoded bucket record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// The bucket slot this record was written for.
    pub stored_index: u32,
    pub entries: Vec<BucketEntry>,
}

impl Bucket {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(BUCKET_RECORD_VERSION);
        out.extend_from_slice(&self.stored_index.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.hash.to_le_bytes());
            out.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(&entry.path.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;
        let version = take(&mut cursor, 1)?[0];
        ensure!(
            version == BUCKET_RECORD_VERSION,
            "unknown bucket record version {}",
            version
        );
        let stored_index = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
        let count = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let hash = u64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
            let key_len = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
            let key = take(&mut cursor, key_len)?.to_vec();
            let path = i64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
            entries.push(BucketEntry { hash, key, path });
        }
        ensure!(cursor.is_empty(), "trailing bytes in bucket record");
        Ok(Bucket {
            stored_index,
            entries,
        })
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if cursor.len() < n {
        bail!("bucket record truncated");
    }
    let (head, rest) = cursor.split_at(n);
    *cursor = rest;
    Ok(head)
}

/// The bucketed key-to-path index.
#[derive(Clone)]
pub struct KeyIndex {
    store: Arc<RecordStore>,
    // Power-of-two length; slot = hash & (len - 1).
    locations: Vec<DiskLocation>,
    split_threshold: usize,
}

impl KeyIndex {
    pub fn new(store: Arc<RecordStore>, initial_buckets: usize, split_threshold: usize) -> Self {
        assert!(
            initial_buckets.is_power_of_two(),
            "bucket count must be a power of two: {}",
            initial_buckets
        );
        assert!(split_threshold > 0);
        KeyIndex {
            store,
            locations: vec![DiskLocation::NULL; initial_buckets],
            split_threshold,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.locations.len()
    }

    fn mask(&self) -> u64 {
        self.locations.len() as u64 - 1
    }

    fn slot_of(&self, hash: u64) -> usize {
        (hash & self.mask()) as usize
    }

    /// Read the bucket record currently reachable from `slot`, or `None` for an
    /// empty slot.
    pub fn read_bucket(&self, slot: usize) -> Result<Option<Bucket>> {
        let location = self.locations[slot];
        if location.is_null() {
            return Ok(None);
        }
        match self.store.read(location)? {
            Some(bytes) => Ok(Some(Bucket::decode(&bytes)?)),
            None => bail!("key index bucket {} is unreadable at {}", slot, location),
        }
    }

    /// The path mapped to `key`, or `default_path` when absent.
    pub fn get(&self, key: &[u8], default_path: i64) -> Result<i64> {
        let hash = fxhash::hash64(key);
        let Some(bucket) = self.read_bucket(self.slot_of(hash))? else {
            return Ok(default_path);
        };
        for entry in &bucket.entries {
            if entry.hash == hash && entry.key == key {
                return Ok(entry.path);
            }
        }
        Ok(default_path)
    }

    /// Map `key` to `path`, replacing any existing mapping.
    pub fn put(&mut self, key: &[u8], path: i64) -> Result<()> {
        let hash = fxhash::hash64(key);
        let slot = self.slot_of(hash);
        let mut entries = self.slot_entries(slot)?;
        match entries.iter_mut().find(|e| e.hash == hash && e.key == key) {
            Some(entry) => entry.path = path,
            None => entries.push(BucketEntry {
                hash,
                key: key.to_vec(),
                path,
            }),
        }
        let overflow = entries.len() > self.split_threshold;
        self.write_bucket(slot, entries)?;
        if overflow && self.locations.len() < MAX_BUCKET_COUNT {
            self.grow();
        }
        Ok(())
    }

    /// Remove the mapping for `key`, if any.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.delete_impl(key, None)
    }

    /// Remove the mapping for `key` only if it currently points at `path`. Used when
    /// unwinding stale leaves: a key that has since been re-homed to another path
    /// must keep its newer mapping.
    pub fn delete_if(&mut self, key: &[u8], path: i64) -> Result<()> {
        self.delete_impl(key, Some(path))
    }

    fn delete_impl(&mut self, key: &[u8], expected_path: Option<i64>) -> Result<()> {
        let hash = fxhash::hash64(key);
        let slot = self.slot_of(hash);
        let mut entries = self.slot_entries(slot)?;
        let before = entries.len();
        entries.retain(|e| {
            !(e.hash == hash && e.key == key && expected_path.map_or(true, |p| p == e.path))
        });
        if entries.len() != before || self.shared_record(slot) {
            self.write_bucket(slot, entries)?;
        }
        Ok(())
    }

    /// The entries belonging to `slot` under the current mask. Entries in a shared
    /// post-growth record that hash to the twin slot are filtered out; they stay
    /// reachable through the twin's own location.
    fn slot_entries(&self, slot: usize) -> Result<Vec<BucketEntry>> {
        let Some(bucket) = self.read_bucket(slot)? else {
            return Ok(Vec::new());
        };
        ensure!(
            (bucket.stored_index as usize) & slot == bucket.stored_index as usize,
            "bucket at slot {} carries incompatible index {}",
            slot,
            bucket.stored_index
        );
        let mask = self.mask();
        Ok(bucket
            .entries
            .into_iter()
            .filter(|e| (e.hash & mask) as usize == slot)
            .collect())
    }

    fn shared_record(&self, slot: usize) -> bool {
        match self.read_bucket(slot) {
            Ok(Some(bucket)) => bucket.stored_index as usize != slot,
            _ => false,
        }
    }

    fn write_bucket(&mut self, slot: usize, entries: Vec<BucketEntry>) -> Result<()> {
        if entries.is_empty() {
            self.locations[slot] = DiskLocation::NULL;
            return Ok(());
        }
        let bucket = Bucket {
            stored_index: slot as u32,
            entries,
        };
        let location = self.store.write(&bucket.encode())?;
        self.locations[slot] = location;
        Ok(())
    }

    /// Double the bucket count. The lower half of the location array is copied into
    /// the upper half; records split lazily on the next write to either slot.
    fn grow(&mut self) {
        let lower = self.locations.clone();
        self.locations.extend(lower);
        tracing::debug!(buckets = self.locations.len(), "key index grew");
    }
}
