//! Arithmetic over virtual tree paths.
//!
//! A path is a plain integer identifying a node in a complete binary tree laid out in
//! breadth-first order: the root is path 0, and the children of path `p` are `2p+1` and
//! `2p+2`. Leaves occupy the contiguous range `[first_leaf_path, last_leaf_path]`.
//!
//! The tree is kept dense: with `n >= 2` leaves, `first_leaf_path = n - 1` and
//! `last_leaf_path = 2n - 2`, so leaves span at most two adjacent ranks. A tree with a
//! single leaf stores it at path 1, and an empty tree has both boundaries set to
//! [`INVALID_PATH`].

/// Sentinel for "no such path". Used as the leaf boundary of an empty tree.
pub const INVALID_PATH: i64 = -1;

/// The path of the tree root.
pub const ROOT_PATH: i64 = 0;

/// The rank (depth) of a path. The root is at rank 0, its children at rank 1, and so on.
pub fn rank(path: i64) -> u32 {
    debug_assert!(path >= 0);
    63 - ((path + 1) as u64).leading_zeros()
}

/// The parent of a path. Must not be called on the root.
pub fn parent(path: i64) -> i64 {
    debug_assert!(path > 0);
    (path - 1) >> 1
}

/// The left child of a path.
pub fn left_child(path: i64) -> i64 {
    2 * path + 1
}

/// The right child of a path.
pub fn right_child(path: i64) -> i64 {
    2 * path + 2
}

/// The leftmost descendant of `path`, `levels` ranks below it.
pub fn left_grand_child(path: i64, levels: u32) -> i64 {
    ((path + 1) << levels) - 1
}

/// The rightmost descendant of `path`, `levels` ranks below it.
pub fn right_grand_child(path: i64, levels: u32) -> i64 {
    ((path + 2) << levels) - 2
}

/// The ancestor of `path`, `levels` ranks above it.
pub fn grand_parent(path: i64, levels: u32) -> i64 {
    debug_assert!(rank(path) >= levels);
    ((path + 1) >> levels) - 1
}

/// Whether `path` is a leaf of a tree with the given leaf boundaries.
pub fn is_leaf(path: i64, first_leaf_path: i64, last_leaf_path: i64) -> bool {
    first_leaf_path > 0 && path >= first_leaf_path && path <= last_leaf_path
}

/// Whether `path` is an internal node of a tree with the given first leaf boundary.
pub fn is_internal(path: i64, first_leaf_path: i64) -> bool {
    first_leaf_path > 0 && path >= 0 && path < first_leaf_path
}

/// The leaf boundaries of a dense tree holding `leaf_count` leaves.
pub fn leaf_boundaries(leaf_count: u64) -> (i64, i64) {
    match leaf_count {
        0 => (INVALID_PATH, INVALID_PATH),
        1 => (1, 1),
        n => ((n - 1) as i64, (2 * n - 2) as i64),
    }
}

/// The number of leaves of a dense tree with the given boundaries.
pub fn leaf_count(first_leaf_path: i64, last_leaf_path: i64) -> u64 {
    if last_leaf_path < 1 {
        0
    } else {
        (last_leaf_path - first_leaf_path + 1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn ranks() {
        assert_eq!(rank(0), 0);
        assert_eq!(rank(1), 1);
        assert_eq!(rank(2), 1);
        assert_eq!(rank(3), 2);
        assert_eq!(rank(6), 2);
        assert_eq!(rank(7), 3);
        assert_eq!(rank(14), 3);
    }

    #[test]
    fn grand_relations() {
        assert_eq!(left_grand_child(0, 1), 1);
        assert_eq!(left_grand_child(0, 2), 3);
        assert_eq!(right_grand_child(0, 2), 6);
        assert_eq!(left_grand_child(2, 2), 11);
        assert_eq!(grand_parent(11, 2), 2);
        assert_eq!(grand_parent(9, 1), 4);
    }

    #[test]
    fn boundaries_round_trip() {
        for n in 0..1000u64 {
            let (first, last) = leaf_boundaries(n);
            assert_eq!(leaf_count(first, last), n);
            if n >= 2 {
                // The parent of the last leaf sits just below the first leaf.
                assert_eq!(parent(last), first - 1);
            }
        }
    }

    quickcheck! {
        fn children_invert_parent(path: i64) -> bool {
            let path = path.rem_euclid(1 << 40);
            parent(left_child(path)) == path && parent(right_child(path)) == path
        }

        fn rank_of_children(path: i64) -> bool {
            let path = path.rem_euclid(1 << 40);
            rank(left_child(path)) == rank(path) + 1
                && rank(right_child(path)) == rank(path) + 1
        }

        fn grand_child_inverts_grand_parent(path: i64, levels: u8) -> bool {
            let path = path.rem_euclid(1 << 30);
            let levels = (levels % 8) as u32;
            grand_parent(left_grand_child(path, levels), levels) == path
                && grand_parent(right_grand_child(path, levels), levels) == path
        }
    }
}
