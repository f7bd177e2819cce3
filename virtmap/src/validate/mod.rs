//! Read-only auditors over the storage invariants.
//!
//! Two audits run in parallel over disjoint ranges on a worker pool: the leaf audit
//! re-derives every leaf-index entry from the record it points at, and the bucket
//! audit re-derives every key-index entry back through the leaf index. Anomalies are
//! categorized and counted; sample collection per category is capped so a badly
//! corrupted tree cannot exhaust memory, but counting never stops.
//!
//! [`validate`] fails when any non-excluded category is non-empty. Exceeding the
//! sample cap is never by itself a failure.

use crate::index::{KeyIndex, PathIndex};
use crate::map::VirtualMap;
use crate::store::{DiskLocation, RecordStore};
use anyhow::{bail, Result};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use virtmap_core::chunk::{self, HashChunk};
use virtmap_core::path::is_leaf;
use virtmap_core::{Hash, TreeHasher, VirtualLeafBytes};

/// The distinct invariant violations an audit can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyCategory {
    /// A key-index entry points at a path that is not a live leaf, or a leaf record
    /// is indexed at an internal path.
    StalePath,
    /// An indexed record is absent or unreadable.
    MissingRecord,
    /// A record's key disagrees with the index entry that reached it.
    KeyMismatch,
    /// A record's own path field disagrees with the index slot it was read from.
    PathMismatch,
    /// A stored hash disagrees with the one re-derived from the record bytes.
    HashMismatch,
    /// A bucket's stored index is incompatible with the slot it is reachable from.
    BadBucketIndex,
    /// The chunk index is not sized by the chunk-count function of the leaf range.
    ChunkCountMismatch,
}

pub const ALL_CATEGORIES: [AnomalyCategory; 7] = [
    AnomalyCategory::StalePath,
    AnomalyCategory::MissingRecord,
    AnomalyCategory::KeyMismatch,
    AnomalyCategory::PathMismatch,
    AnomalyCategory::HashMismatch,
    AnomalyCategory::BadBucketIndex,
    AnomalyCategory::ChunkCountMismatch,
];

/// One recorded invariant violation.
#[derive(Debug, Clone)]
pub struct Anomaly {
    pub category: AnomalyCategory,
    /// The leaf path, chunk id, or bucket slot the violation was found at.
    pub at: i64,
    pub detail: String,
}

/// Options for one audit run.
pub struct ValidatorOptions {
    /// Parallel audit workers per phase.
    pub workers: usize,
    /// Per-category cap on collected anomaly samples. Counting continues past it.
    pub anomaly_cap: usize,
    /// Categories that do not fail [`validate`].
    pub exclude: Vec<AnomalyCategory>,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        ValidatorOptions {
            workers: 4,
            anomaly_cap: 100,
            exclude: Vec::new(),
        }
    }
}

/// The outcome of an audit: per-category counts plus capped samples.
#[derive(Debug, Default)]
pub struct ValidationReport {
    counts: HashMap<AnomalyCategory, u64>,
    samples: HashMap<AnomalyCategory, Vec<Anomaly>>,
}

impl ValidationReport {
    pub fn count(&self, category: AnomalyCategory) -> u64 {
        self.counts.get(&category).copied().unwrap_or(0)
    }

    pub fn anomalies(&self, category: AnomalyCategory) -> &[Anomaly] {
        self.samples.get(&category).map_or(&[], Vec::as_slice)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Whether every category outside `excluded` is empty.
    pub fn passed(&self, excluded: &[AnomalyCategory]) -> bool {
        ALL_CATEGORIES
            .iter()
            .filter(|category| !excluded.contains(category))
            .all(|category| self.count(*category) == 0)
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total() == 0 {
            return write!(f, "no anomalies");
        }
        let mut first = true;
        for category in ALL_CATEGORIES {
            let count = self.count(category);
            if count == 0 {
                continue;
            }
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{:?}: {}", category, count)?;
            first = false;
        }
        Ok(())
    }
}

struct Collector {
    cap: usize,
    counts: HashMap<AnomalyCategory, u64>,
    samples: HashMap<AnomalyCategory, Vec<Anomaly>>,
}

impl Collector {
    fn new(cap: usize) -> Self {
        Collector {
            cap,
            counts: HashMap::new(),
            samples: HashMap::new(),
        }
    }

    fn record(&mut self, category: AnomalyCategory, at: i64, detail: impl Into<String>) {
        *self.counts.entry(category).or_insert(0) += 1;
        let samples = self.samples.entry(category).or_default();
        if samples.len() < self.cap {
            samples.push(Anomaly {
                category,
                at,
                detail: detail.into(),
            });
        }
    }

    fn merge_into(self, report: &mut ValidationReport, cap: usize) {
        for (category, count) in self.counts {
            *report.counts.entry(category).or_insert(0) += count;
        }
        for (category, mut anomalies) in self.samples {
            let samples = report.samples.entry(category).or_default();
            let room = cap.saturating_sub(samples.len());
            anomalies.truncate(room);
            samples.append(&mut anomalies);
        }
    }
}

/// Everything a worker needs, detached from the map so it can move to the pool.
struct AuditContext<H: TreeHasher> {
    leaf_store: Arc<RecordStore>,
    chunk_store: Arc<RecordStore>,
    leaf_index: PathIndex,
    chunk_index: PathIndex,
    key_index: KeyIndex,
    first_leaf_path: i64,
    last_leaf_path: i64,
    chunk_height: u32,
    _hasher: PhantomData<fn() -> H>,
}

impl<H: TreeHasher> Clone for AuditContext<H> {
    fn clone(&self) -> Self {
        AuditContext {
            leaf_store: Arc::clone(&self.leaf_store),
            chunk_store: Arc::clone(&self.chunk_store),
            leaf_index: self.leaf_index.clone(),
            chunk_index: self.chunk_index.clone(),
            key_index: self.key_index.clone(),
            first_leaf_path: self.first_leaf_path,
            last_leaf_path: self.last_leaf_path,
            chunk_height: self.chunk_height,
            _hasher: PhantomData,
        }
    }
}

impl<H: TreeHasher> AuditContext<H> {
    /// The raw bytes and decoded form of the leaf record indexed at `path`.
    fn leaf_record(&self, path: i64) -> Result<Option<(Vec<u8>, VirtualLeafBytes)>> {
        let location = self.leaf_index.get(path, DiskLocation::NULL);
        if location.is_null() {
            return Ok(None);
        }
        let Some(bytes) = self.leaf_store.read(location)? else {
            return Ok(None);
        };
        match VirtualLeafBytes::decode(&bytes) {
            Ok(record) => Ok(Some((bytes, record))),
            Err(_) => Ok(None),
        }
    }

    /// The hash stored for `path` in its chunk.
    fn stored_hash(&self, path: i64) -> Result<Hash> {
        let chunk_path = chunk::path_to_chunk_path(path, self.chunk_height);
        let id = chunk::chunk_path_to_chunk_id(chunk_path, self.chunk_height);
        let location = self.chunk_index.get(id, DiskLocation::NULL);
        if location.is_null() {
            bail!("no hash chunk indexed at id {}", id);
        }
        let Some(bytes) = self.chunk_store.read(location)? else {
            bail!("hash chunk {} is unreadable", id);
        };
        let chunk = HashChunk::decode(&bytes, self.chunk_height)?;
        Ok(chunk.calc_hash::<H>(path, self.first_leaf_path, self.last_leaf_path))
    }
}

/// Run the full audit and fail if any non-excluded anomaly category is non-empty.
/// The error message carries the per-category counts; use [`audit`] to inspect the
/// report itself.
pub fn validate<H>(map: &mut VirtualMap<H>, options: &ValidatorOptions) -> Result<()>
where
    H: TreeHasher + 'static,
{
    let report = audit(map, options)?;
    if !report.passed(&options.exclude) {
        tracing::warn!(%report, "validation failed");
        bail!("validation failed: {}", report);
    }
    tracing::info!(anomalies = report.total(), "validation passed");
    Ok(())
}

/// Run the full audit and return the categorized report.
pub fn audit<H>(map: &mut VirtualMap<H>, options: &ValidatorOptions) -> Result<ValidationReport>
where
    H: TreeHasher + 'static,
{
    // Bring the hash chunks up to date so stored hashes are comparable.
    map.root_hash()?;
    let context = AuditContext::<H> {
        leaf_store: Arc::clone(map.leaf_store()),
        chunk_store: Arc::clone(map.chunk_store()),
        leaf_index: map.leaf_index().clone(),
        chunk_index: map.chunk_index().clone(),
        key_index: map.key_index().clone(),
        first_leaf_path: map.first_leaf_path(),
        last_leaf_path: map.last_leaf_path(),
        chunk_height: map.chunk_height(),
        _hasher: PhantomData,
    };

    let mut report = ValidationReport::default();
    let expected_chunks = chunk::min_chunk_count(context.last_leaf_path, context.chunk_height);
    if context.chunk_index.len() as i64 != expected_chunks {
        let mut collector = Collector::new(options.anomaly_cap);
        collector.record(
            AnomalyCategory::ChunkCountMismatch,
            context.chunk_index.len() as i64,
            format!(
                "chunk index holds {} records, leaf range needs {}",
                context.chunk_index.len(),
                expected_chunks
            ),
        );
        collector.merge_into(&mut report, options.anomaly_cap);
    }

    let workers = options.workers.max(1);
    let pool = threadpool::ThreadPool::new(workers);
    let (tx, rx) = crossbeam_channel::unbounded();

    let path_count = context.last_leaf_path + 1;
    for (start, end) in split_range(path_count, workers) {
        let context = context.clone();
        let cap = options.anomaly_cap;
        spawn_task(
            &pool,
            move || audit_paths(&context, start..end, cap),
            tx.clone(),
        );
    }
    let bucket_count = context.key_index.bucket_count() as i64;
    for (start, end) in split_range(bucket_count, workers) {
        let context = context.clone();
        let cap = options.anomaly_cap;
        spawn_task(
            &pool,
            move || audit_buckets(&context, start..end, cap),
            tx.clone(),
        );
    }
    drop(tx);

    for outcome in rx {
        match outcome {
            Ok(Ok(collector)) => collector.merge_into(&mut report, options.anomaly_cap),
            Ok(Err(error)) => return Err(error),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    Ok(report)
}

/// Re-derive every leaf-index entry in `[range.start, range.end)`.
fn audit_paths<H: TreeHasher>(
    context: &AuditContext<H>,
    range: std::ops::Range<i64>,
    cap: usize,
) -> Result<Collector> {
    let mut collector = Collector::new(cap);
    for path in range {
        let leaf = is_leaf(path, context.first_leaf_path, context.last_leaf_path);
        let record = context.leaf_record(path)?;
        let Some((bytes, record)) = record else {
            if leaf {
                collector.record(
                    AnomalyCategory::MissingRecord,
                    path,
                    "leaf path with no readable record",
                );
            }
            continue;
        };
        if !leaf {
            collector.record(
                AnomalyCategory::StalePath,
                path,
                "leaf record indexed at an internal path",
            );
            continue;
        }
        if record.path != path {
            collector.record(
                AnomalyCategory::PathMismatch,
                path,
                format!("record carries path {}", record.path),
            );
            continue;
        }
        if record.encode() != bytes {
            collector.record(
                AnomalyCategory::HashMismatch,
                path,
                "leaf record does not re-encode to its stored bytes",
            );
        }
        match context.stored_hash(path) {
            Ok(stored) => {
                if stored != record.hash::<H>() {
                    collector.record(
                        AnomalyCategory::HashMismatch,
                        path,
                        "stored hash disagrees with the leaf record",
                    );
                }
            }
            Err(error) => {
                collector.record(AnomalyCategory::MissingRecord, path, error.to_string());
            }
        }
        let mapped = context
            .key_index
            .get(&record.key, virtmap_core::path::INVALID_PATH)?;
        if mapped != path {
            collector.record(
                AnomalyCategory::KeyMismatch,
                path,
                format!("key index maps the leaf's key to path {}", mapped),
            );
        }
    }
    Ok(collector)
}

/// Re-derive every key-index entry reachable from the bucket slots in
/// `[range.start, range.end)`.
fn audit_buckets<H: TreeHasher>(
    context: &AuditContext<H>,
    range: std::ops::Range<i64>,
    cap: usize,
) -> Result<Collector> {
    let mut collector = Collector::new(cap);
    let mask = context.key_index.bucket_count() as u64 - 1;
    for slot in range {
        let slot = slot as usize;
        let bucket = match context.key_index.read_bucket(slot) {
            Ok(None) => continue,
            Ok(Some(bucket)) => bucket,
            Err(error) => {
                collector.record(AnomalyCategory::MissingRecord, slot as i64, error.to_string());
                continue;
            }
        };
        let stored = bucket.stored_index as usize;
        if stored & slot != stored {
            collector.record(
                AnomalyCategory::BadBucketIndex,
                slot as i64,
                format!("bucket stores index {}", stored),
            );
            continue;
        }
        for entry in &bucket.entries {
            // Entries of a shared post-growth record that belong to the twin slot
            // are audited through the twin.
            if (entry.hash & mask) as usize != slot {
                continue;
            }
            if entry.hash & stored as u64 != stored as u64 {
                collector.record(
                    AnomalyCategory::BadBucketIndex,
                    slot as i64,
                    format!("entry hash {:#x} incompatible with index {}", entry.hash, stored),
                );
            }
            if fxhash::hash64(&entry.key[..]) != entry.hash {
                collector.record(
                    AnomalyCategory::HashMismatch,
                    slot as i64,
                    "entry hash disagrees with its key bytes",
                );
            }
            if !is_leaf(entry.path, context.first_leaf_path, context.last_leaf_path) {
                collector.record(
                    AnomalyCategory::StalePath,
                    entry.path,
                    "key index entry points outside the leaf range",
                );
                continue;
            }
            let Some((_, record)) = context.leaf_record(entry.path)? else {
                collector.record(
                    AnomalyCategory::MissingRecord,
                    entry.path,
                    "key index entry points at an unreadable leaf record",
                );
                continue;
            };
            if record.path != entry.path {
                collector.record(
                    AnomalyCategory::PathMismatch,
                    entry.path,
                    format!("record carries path {}", record.path),
                );
                continue;
            }
            if record.key != entry.key {
                collector.record(
                    AnomalyCategory::KeyMismatch,
                    entry.path,
                    "record carries a different key than the entry",
                );
            }
        }
    }
    Ok(collector)
}

/// Split `[0, count)` into up to `workers` contiguous half-open ranges.
fn split_range(count: i64, workers: usize) -> Vec<(i64, i64)> {
    if count <= 0 {
        return Vec::new();
    }
    let chunk = (count + workers as i64 - 1) / workers as i64;
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < count {
        let end = (start + chunk).min(count);
        ranges.push((start, end));
        start = end;
    }
    ranges
}

fn spawn_task<F, R>(
    pool: &threadpool::ThreadPool,
    task: F,
    tx: Sender<std::thread::Result<R>>,
) where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    pool.execute(move || {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
        let _ = tx.send(outcome);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use virtmap_core::hasher::Blake3Hasher;

    fn populated_map(dir: &std::path::Path, leaves: u32) -> VirtualMap<Blake3Hasher> {
        let mut options = Options::new();
        options.path(dir);
        options.chunk_height(2);
        options.initial_buckets(4);
        let mut map = VirtualMap::open(&options).unwrap();
        for n in 0..leaves {
            map.put(format!("key{}", n).as_bytes(), &n.to_le_bytes())
                .unwrap();
        }
        map
    }

    #[test]
    fn clean_map_validates() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 64);
        validate(&mut map, &ValidatorOptions::default()).unwrap();
        let report = audit(&mut map, &ValidatorOptions::default()).unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.passed(&[]));
    }

    #[test]
    fn empty_map_validates() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 0);
        validate(&mut map, &ValidatorOptions::default()).unwrap();
    }

    #[test]
    fn phantom_key_entry_is_one_key_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 16);
        // A key the map never held, pointing at a live leaf whose record carries a
        // different key.
        let target = map.first_leaf_path();
        map.key_index_mut().put(b"phantom", target).unwrap();
        let report = audit(&mut map, &ValidatorOptions::default()).unwrap();
        assert_eq!(report.count(AnomalyCategory::KeyMismatch), 1);
        assert_eq!(report.total(), 1);
        let anomaly = &report.anomalies(AnomalyCategory::KeyMismatch)[0];
        assert_eq!(anomaly.at, target);
        assert!(validate(&mut map, &ValidatorOptions::default()).is_err());
    }

    #[test]
    fn stale_path_entry_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 16);
        let beyond = map.last_leaf_path() + 5;
        map.key_index_mut().put(b"ghost", beyond).unwrap();
        let report = audit(&mut map, &ValidatorOptions::default()).unwrap();
        assert_eq!(report.count(AnomalyCategory::StalePath), 1);
    }

    #[test]
    fn chunk_count_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 16);
        map.root_hash().unwrap();
        map.chunk_index_mut().truncate(1);
        let report = audit(&mut map, &ValidatorOptions::default()).unwrap();
        assert!(report.count(AnomalyCategory::ChunkCountMismatch) >= 1);
        assert!(validate(&mut map, &ValidatorOptions::default()).is_err());
    }

    #[test]
    fn excluded_categories_do_not_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 16);
        let target = map.first_leaf_path();
        map.key_index_mut().put(b"phantom", target).unwrap();
        let mut options = ValidatorOptions::default();
        options.exclude = vec![AnomalyCategory::KeyMismatch];
        validate(&mut map, &options).unwrap();
    }

    #[test]
    fn sample_cap_bounds_collection_but_not_counting() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = populated_map(dir.path(), 16);
        let beyond = map.last_leaf_path() + 10;
        for n in 0..20u32 {
            map.key_index_mut()
                .put(format!("ghost{}", n).as_bytes(), beyond)
                .unwrap();
        }
        let mut options = ValidatorOptions::default();
        options.anomaly_cap = 5;
        let report = audit(&mut map, &options).unwrap();
        assert_eq!(report.count(AnomalyCategory::StalePath), 20);
        assert!(report.anomalies(AnomalyCategory::StalePath).len() <= 5);
    }
}
