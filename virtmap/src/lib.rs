//! A disk-backed virtual merkle map with teacher/learner tree synchronization.
//!
//! The storage engine keeps a very large keyed merkle tree on disk: leaves and hash
//! chunks live in append-only record stores, dense path indices map tree paths to
//! disk locations, and a bucketed hash map resolves key bytes to leaf paths. On top
//! of it, the sync protocol lets an authoritative peer (the teacher) stream only the
//! divergent parts of its tree to a stale peer (the learner), and the validators
//! audit every storage invariant the protocol's correctness rests on.
//!
//! ```no_run
//! use virtmap::{Options, VirtualMap};
//! use virtmap_core::hasher::Blake3Hasher;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut options = Options::new();
//! options.path("/tmp/my_map");
//! let mut map: VirtualMap<Blake3Hasher> = VirtualMap::open(&options)?;
//! map.put(b"account/1", b"balance=10")?;
//! let root = map.root_hash()?;
//! # let _ = root;
//! # Ok(())
//! # }
//! ```

pub mod index;
pub mod map;
pub mod options;
pub mod store;
pub mod sync;
pub mod validate;

pub use map::{SnapshotReady, VirtualMap, VirtualMapSnapshot};
pub use options::Options;
pub use store::DiskLocation;
pub use sync::{learn, reconnect, teach, TransferStats};
pub use validate::{audit, validate, AnomalyCategory, ValidationReport, ValidatorOptions};
