//! Tree views: the capability surface the sync tasks drive.
//!
//! A session is generic over one teacher-side and one learner-side view. The
//! whole-map views cover an entire virtual map from its root; the embedded-subtree
//! views expose one internal node's subtree, for sessions driven by an enclosing
//! tree walk that has already placed the subtree root. Node identity is the path in
//! both cases, so a view never hands out node handles, only paths.

use crate::map::{VirtualMap, VirtualMapSnapshot};
use anyhow::{ensure, Result};
use virtmap_core::{Hash, TreeHasher, VirtualLeafBytes};

/// Read capabilities of the authoritative side of a session.
pub trait TeacherView: Sync {
    /// The path the session starts from.
    fn root_path(&self) -> i64;

    fn leaf_boundaries(&self) -> (i64, i64);

    fn is_leaf(&self, path: i64) -> bool;

    /// The hash of the session root.
    fn root_hash(&self) -> Result<Hash>;

    fn node_hash(&self, path: i64) -> Result<Hash>;

    fn leaf_bytes(&self, path: i64) -> Result<VirtualLeafBytes>;
}

impl<H: TreeHasher> TeacherView for VirtualMapSnapshot<H> {
    fn root_path(&self) -> i64 {
        virtmap_core::path::ROOT_PATH
    }

    fn leaf_boundaries(&self) -> (i64, i64) {
        (self.first_leaf_path(), self.last_leaf_path())
    }

    fn is_leaf(&self, path: i64) -> bool {
        VirtualMapSnapshot::is_leaf(self, path)
    }

    fn root_hash(&self) -> Result<Hash> {
        Ok(VirtualMapSnapshot::root_hash(self))
    }

    fn node_hash(&self, path: i64) -> Result<Hash> {
        VirtualMapSnapshot::node_hash(self, path)
    }

    fn leaf_bytes(&self, path: i64) -> Result<VirtualLeafBytes> {
        VirtualMapSnapshot::leaf_bytes(self, path)
    }
}

/// A teacher view over the subtree rooted at one node of a snapshot.
pub struct SubtreeTeacherView<'a, H: TreeHasher> {
    snapshot: &'a VirtualMapSnapshot<H>,
    root: i64,
}

impl<'a, H: TreeHasher> SubtreeTeacherView<'a, H> {
    pub fn new(snapshot: &'a VirtualMapSnapshot<H>, root: i64) -> Result<Self> {
        ensure!(snapshot.has_path(root), "no subtree rooted at path {}", root);
        Ok(SubtreeTeacherView { snapshot, root })
    }
}

impl<H: TreeHasher> TeacherView for SubtreeTeacherView<'_, H> {
    fn root_path(&self) -> i64 {
        self.root
    }

    fn leaf_boundaries(&self) -> (i64, i64) {
        (self.snapshot.first_leaf_path(), self.snapshot.last_leaf_path())
    }

    fn is_leaf(&self, path: i64) -> bool {
        self.snapshot.is_leaf(path)
    }

    fn root_hash(&self) -> Result<Hash> {
        self.snapshot.node_hash(self.root)
    }

    fn node_hash(&self, path: i64) -> Result<Hash> {
        self.snapshot.node_hash(path)
    }

    fn leaf_bytes(&self, path: i64) -> Result<VirtualLeafBytes> {
        self.snapshot.leaf_bytes(path)
    }
}

/// Mutation capabilities of the resynchronizing side of a session.
///
/// `original_*` reads come from the tree as it stood when the session opened; the
/// adopt methods mutate the live map in place.
pub trait LearnerView {
    fn root_path(&self) -> i64;

    /// The pre-session hash of the session root, announced to the teacher.
    fn original_root_hash(&self) -> Result<Hash>;

    /// The pre-session hash at `path`, or `None` if the original tree had no node
    /// there.
    fn original_node_hash(&self, path: i64) -> Result<Option<Hash>>;

    fn adopt_leaf_boundaries(&mut self, first: i64, last: i64) -> Result<()>;

    fn adopt_leaf(&mut self, leaf: &VirtualLeafBytes) -> Result<()>;

    /// Rehash the reconstructed tree and return the session root's new hash.
    fn finish(&mut self) -> Result<Hash>;
}

/// The whole-map learner view.
pub struct MapLearnerView<'a, H: TreeHasher> {
    map: &'a mut VirtualMap<H>,
    original: VirtualMapSnapshot<H>,
}

impl<'a, H: TreeHasher> MapLearnerView<'a, H> {
    pub fn new(map: &'a mut VirtualMap<H>) -> Result<Self> {
        let original = map.snapshot()?;
        Ok(MapLearnerView { map, original })
    }
}

impl<H: TreeHasher> LearnerView for MapLearnerView<'_, H> {
    fn root_path(&self) -> i64 {
        virtmap_core::path::ROOT_PATH
    }

    fn original_root_hash(&self) -> Result<Hash> {
        Ok(self.original.root_hash())
    }

    fn original_node_hash(&self, path: i64) -> Result<Option<Hash>> {
        if !self.original.has_path(path) {
            return Ok(None);
        }
        Ok(Some(self.original.node_hash(path)?))
    }

    fn adopt_leaf_boundaries(&mut self, first: i64, last: i64) -> Result<()> {
        self.map.adopt_leaf_boundaries(first, last)
    }

    fn adopt_leaf(&mut self, leaf: &VirtualLeafBytes) -> Result<()> {
        self.map.adopt_leaf(leaf)
    }

    fn finish(&mut self) -> Result<Hash> {
        self.map.root_hash()
    }
}

/// A learner view over the subtree rooted at one node of the map.
///
/// A subtree session cannot change the map's leaf boundaries, so the teacher's
/// boundaries must equal the learner's; diverged shapes need a whole-map session.
pub struct SubtreeLearnerView<'a, H: TreeHasher> {
    inner: MapLearnerView<'a, H>,
    root: i64,
}

impl<'a, H: TreeHasher> SubtreeLearnerView<'a, H> {
    pub fn new(map: &'a mut VirtualMap<H>, root: i64) -> Result<Self> {
        let inner = MapLearnerView::new(map)?;
        ensure!(
            inner.original.has_path(root),
            "no subtree rooted at path {}",
            root
        );
        Ok(SubtreeLearnerView { inner, root })
    }
}

impl<H: TreeHasher> LearnerView for SubtreeLearnerView<'_, H> {
    fn root_path(&self) -> i64 {
        self.root
    }

    fn original_root_hash(&self) -> Result<Hash> {
        self.inner.original.node_hash(self.root)
    }

    fn original_node_hash(&self, path: i64) -> Result<Option<Hash>> {
        self.inner.original_node_hash(path)
    }

    fn adopt_leaf_boundaries(&mut self, first: i64, last: i64) -> Result<()> {
        ensure!(
            (first, last) == (self.inner.original.first_leaf_path(), self.inner.original.last_leaf_path()),
            "subtree session cannot move the leaf boundaries: ({}, {}) vs ({}, {})",
            first,
            last,
            self.inner.original.first_leaf_path(),
            self.inner.original.last_leaf_path()
        );
        Ok(())
    }

    fn adopt_leaf(&mut self, leaf: &VirtualLeafBytes) -> Result<()> {
        self.inner.adopt_leaf(leaf)
    }

    fn finish(&mut self) -> Result<Hash> {
        self.inner.map.node_hash(self.root)
    }
}
