//! Hash chunks: batched storage of several tree ranks' worth of hashes.
//!
//! A chunk is identified by its chunk path, an internal path whose rank is a multiple
//! of the configured chunk height. The chunk covers the `height` ranks below that path
//! and holds `2^height` hash slots, one per path at its deepest rank. The hash *at* the
//! chunk path itself belongs to the parent chunk.
//!
//! Hashes at intermediate ranks are not stored for full chunks; they are recomputed on
//! demand from the deepest rank. A partial chunk, one straddling the leaf boundary,
//! stores a leaf's hash at the slot of the leaf's leftmost descendant at the deepest
//! rank. `data_rank` tracks the deepest relative rank actually populated, which lets
//! serialization pack only `2^data_rank` stride slots.
//!
//! Chunks are indexed on disk by a dense chunk id: the root chunk has id 0, the chunks
//! one chunk-height down have ids 1 to `2^height`, and so on, left to right.

use crate::hasher::{Hash, TreeHasher, HASH_SIZE, NULL_HASH};
use crate::path::{left_child, left_grand_child, grand_parent, rank, right_child, right_grand_child};
use crate::records::{CodecError, Reader};

const CHUNK_RECORD_VERSION: u8 = 1;

/// The number of hash slots in a chunk of the given height.
pub fn chunk_size(chunk_height: u32) -> usize {
    assert!(chunk_height > 0);
    1 << chunk_height
}

/// The id, starting from 0, of the chunk of the given height containing the hash for
/// the given path.
pub fn path_to_chunk_id(path: i64, chunk_height: u32) -> i64 {
    assert!(path > 0);
    assert!(chunk_height > 0);
    let pp = (path + 1) as u64;
    let z = pp.leading_zeros();
    let r = (64 - z - 2) % chunk_height + 1;
    let m = (1u64 << 63) >> (z + r);
    (((pp >> r) ^ m) + (m - 1) / ((1u64 << chunk_height) - 1)) as i64
}

/// The chunk path of the chunk with the given id and height.
pub fn chunk_id_to_chunk_path(chunk_id: i64, chunk_height: u32) -> i64 {
    assert!(chunk_id >= 0);
    assert!(chunk_height > 0);
    if chunk_id == 0 {
        return 0;
    }
    let child_count = 1i64 << chunk_height;
    let mut chunk_rank = 0;
    let mut chunks_at_rank = 1i64;
    let mut id = 0i64;
    while id < chunk_id {
        chunks_at_rank *= child_count;
        id += chunks_at_rank;
        chunk_rank += chunk_height;
    }
    left_grand_child(0, chunk_rank) + chunk_id - id + chunks_at_rank - 1
}

/// The chunk path of the chunk of the given height containing the hash for `path`.
pub fn path_to_chunk_path(path: i64, chunk_height: u32) -> i64 {
    assert!(path > 0);
    assert!(chunk_height > 0);
    let rank_dif = rank(path) % chunk_height;
    grand_parent(path, if rank_dif == 0 { chunk_height } else { rank_dif })
}

/// The id of the chunk rooted at the given chunk path.
pub fn chunk_path_to_chunk_id(chunk_path: i64, chunk_height: u32) -> i64 {
    path_to_chunk_id(left_child(chunk_path), chunk_height)
}

/// The slot index of `path` within the chunk at `chunk_path`. Paths are global, not
/// relative to the chunk. Intermediate-rank paths map to the slot of their leftmost
/// descendant at the chunk's deepest rank.
///
/// Panics if the path is outside the chunk.
pub fn path_index_in_chunk(path: i64, chunk_path: i64, chunk_height: u32) -> usize {
    let chunk_rank = rank(chunk_path);
    let path_rank = rank(path);
    assert!(
        path_rank > chunk_rank && path_rank <= chunk_rank + chunk_height,
        "path {} is not in chunk {}/{}",
        path,
        chunk_path,
        chunk_height
    );
    let rank_dif = path_rank % chunk_height;
    let mapped = if rank_dif == 0 {
        path
    } else {
        left_grand_child(path, chunk_height - rank_dif)
    };
    let first = left_grand_child(chunk_path, chunk_height);
    assert!(
        mapped >= first && mapped < first + chunk_size(chunk_height) as i64,
        "path {} is not in chunk {}/{}",
        path,
        chunk_path,
        chunk_height
    );
    (mapped - first) as usize
}

/// Given the highest live path, returns the last chunk id needed so that chunks 0 to
/// the id cover all hashes up to (and including) that path.
pub fn last_chunk_id_for_paths(max_path: i64, chunk_height: u32) -> i64 {
    assert!(max_path > 0);
    // The chunk containing max_path itself.
    let max_path_chunk_id = path_to_chunk_id(max_path, chunk_height);
    // The chunk covering the rightmost path one rank up may be greater.
    let prev_rank = std::cmp::max(1, rank(max_path).saturating_sub(1));
    let max_path_in_prev_rank = right_grand_child(0, prev_rank);
    std::cmp::max(
        path_to_chunk_id(max_path_in_prev_rank, chunk_height),
        max_path_chunk_id,
    )
}

/// The number of chunk records needed to cover a tree with the given last leaf path.
/// Zero for an empty tree.
pub fn min_chunk_count(last_leaf_path: i64, chunk_height: u32) -> i64 {
    if last_leaf_path < 1 {
        0
    } else {
        last_chunk_id_for_paths(last_leaf_path, chunk_height) + 1
    }
}

/// An in-memory hash chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChunk {
    path: i64,
    height: u32,
    // Always chunk_size * HASH_SIZE bytes; slots below data_rank are zero.
    data: Vec<u8>,
    data_rank: u32,
}

impl HashChunk {
    /// Create an empty chunk at the given chunk path.
    pub fn new(path: i64, height: u32) -> Self {
        assert!(height > 0, "wrong chunk height: {}", height);
        assert!(
            rank(path) % height == 0,
            "wrong chunk rank/height: {}/{}",
            rank(path),
            height
        );
        HashChunk {
            path,
            height,
            data: vec![0; chunk_size(height) * HASH_SIZE],
            data_rank: 1,
        }
    }

    pub fn path(&self) -> i64 {
        self.path
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chunk_id(&self) -> i64 {
        chunk_path_to_chunk_id(self.path, self.height)
    }

    /// Store the hash for the given path. Panics if the path is outside this chunk.
    pub fn set_hash_at_path(&mut self, path: i64, hash: &Hash) {
        let index = path_index_in_chunk(path, self.path, self.height);
        self.data[index * HASH_SIZE..][..HASH_SIZE].copy_from_slice(hash);
        self.data_rank = std::cmp::max(self.data_rank, rank(path) - rank(self.path));
    }

    /// The stored hash for the given path. Intermediate-rank paths read the slot of
    /// their leftmost deepest-rank descendant; use [`Self::calc_hash`] to recompute an
    /// internal hash of a full chunk instead.
    pub fn hash_at_path(&self, path: i64) -> Hash {
        let index = path_index_in_chunk(path, self.path, self.height);
        // UNWRAP: slots are exactly HASH_SIZE bytes.
        self.data[index * HASH_SIZE..][..HASH_SIZE].try_into().unwrap()
    }

    /// The hash at the given path, recomputing internal-rank hashes from the deepest
    /// stored rank. Paths beyond the last leaf yield [`NULL_HASH`].
    pub fn calc_hash<H: TreeHasher>(&self, path: i64, first_leaf: i64, last_leaf: i64) -> Hash {
        let path_rank = rank(path);
        let chunk_rank = rank(self.path);
        assert!(path_rank >= chunk_rank && path_rank <= chunk_rank + self.height);
        self.calc::<H>(chunk_rank + self.height - path_rank, path, first_leaf, last_leaf)
    }

    /// The hash at the chunk path. Note this hash belongs to the parent chunk, not to
    /// this one; it is how a parent chunk sources its deepest-rank slots.
    pub fn chunk_root_hash<H: TreeHasher>(&self, first_leaf: i64, last_leaf: i64) -> Hash {
        self.calc::<H>(self.height, self.path, first_leaf, last_leaf)
    }

    fn calc<H: TreeHasher>(&self, levels: u32, path: i64, first_leaf: i64, last_leaf: i64) -> Hash {
        if path > last_leaf {
            return NULL_HASH;
        }
        if levels == 0 || (first_leaf > 0 && path >= first_leaf) {
            return self.hash_at_path(path);
        }
        let left = self.calc::<H>(levels - 1, left_child(path), first_leaf, last_leaf);
        let right = self.calc::<H>(levels - 1, right_child(path), first_leaf, last_leaf);
        H::hash_internal(&left, &right)
    }

    /// Serialize the chunk. Only the `2^data_rank` stride slots are written; the chunk
    /// height is not serialized and must be supplied again on decode.
    pub fn encode(&self) -> Vec<u8> {
        let stored = 1usize << self.data_rank;
        let mut out = Vec::with_capacity(1 + 8 + 4 + stored * HASH_SIZE);
        out.push(CHUNK_RECORD_VERSION);
        out.extend_from_slice(&self.path.to_le_bytes());
        out.extend_from_slice(&((stored * HASH_SIZE) as u32).to_le_bytes());
        let step = 1usize << (self.height - self.data_rank);
        for i in (0..chunk_size(self.height)).step_by(step) {
            out.extend_from_slice(&self.data[i * HASH_SIZE..][..HASH_SIZE]);
        }
        out
    }

    /// Decode a chunk serialized with [`Self::encode`] under the same chunk height.
    pub fn decode(bytes: &[u8], height: u32) -> Result<Self, CodecError> {
        assert!(height > 0);
        let mut r = Reader::new(bytes);
        let version = r.read_u8()?;
        if version != CHUNK_RECORD_VERSION {
            return Err(CodecError::UnknownVersion(version));
        }
        let path = r.read_i64()?;
        let len = r.read_u32()? as usize;
        if len % HASH_SIZE != 0 {
            return Err(CodecError::InvalidLength);
        }
        let stored = len / HASH_SIZE;
        if !stored.is_power_of_two() || stored < 2 || stored > chunk_size(height) {
            return Err(CodecError::InvalidLength);
        }
        let data_rank = stored.trailing_zeros();
        let step = 1usize << (height - data_rank);
        let mut data = vec![0; chunk_size(height) * HASH_SIZE];
        for i in 0..stored {
            let hash = r.read_hash()?;
            data[i * step * HASH_SIZE..][..HASH_SIZE].copy_from_slice(&hash);
        }
        if !r.is_empty() {
            return Err(CodecError::InvalidLength);
        }
        Ok(HashChunk {
            path,
            height,
            data,
            data_rank,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::Blake3Hasher;

    #[test]
    fn chunk_id_path_round_trip() {
        for chunk_height in 1..6 {
            for path in 1..5000 {
                let chunk_id = path_to_chunk_id(path, chunk_height);
                let chunk_path = chunk_id_to_chunk_path(chunk_id, chunk_height);
                assert_eq!(rank(chunk_path) % chunk_height, 0);
                if rank(path) % chunk_height == 0 {
                    let index = path_index_in_chunk(path, chunk_path, chunk_height);
                    assert_eq!(
                        path,
                        left_grand_child(chunk_path, chunk_height) + index as i64
                    );
                    assert_eq!(chunk_path, grand_parent(path, chunk_height));
                }
            }
        }
    }

    #[test]
    fn chunk_ids_are_dense() {
        // The first chunk at each chunk rank continues the id sequence.
        assert_eq!(chunk_id_to_chunk_path(0, 2), 0);
        assert_eq!(chunk_id_to_chunk_path(1, 2), 3);
        assert_eq!(chunk_id_to_chunk_path(4, 2), 6);
        assert_eq!(chunk_id_to_chunk_path(5, 2), 15);
        assert_eq!(chunk_id_to_chunk_path(20, 2), 30);
        assert_eq!(chunk_id_to_chunk_path(1, 3), 7);
    }

    #[test]
    fn last_chunk_id_height_2() {
        for (max_path, expected) in [
            (1, 0),
            (3, 0),
            (4, 0),
            (6, 0),
            (7, 1),
            (9, 2),
            (14, 4),
            (15, 4),
            (18, 4),
            (22, 4),
            (29, 4),
            (30, 4),
            (31, 5),
            (63, 20),
        ] {
            assert_eq!(last_chunk_id_for_paths(max_path, 2), expected, "max_path={}", max_path);
        }
    }

    #[test]
    fn last_chunk_id_height_3() {
        for (max_path, expected) in [(1, 0), (4, 0), (11, 0), (15, 1), (17, 2), (29, 8), (32, 8)] {
            assert_eq!(last_chunk_id_for_paths(max_path, 3), expected, "max_path={}", max_path);
        }
    }

    #[test]
    fn min_chunk_count_matches() {
        assert_eq!(min_chunk_count(-1, 2), 0);
        assert_eq!(min_chunk_count(1, 2), 1);
        assert_eq!(min_chunk_count(7, 2), 2);
        assert_eq!(min_chunk_count(14, 2), 5);
    }

    #[test]
    fn partial_chunk_stores_leaves_at_mapped_slots() {
        // Two-leaf tree: leaves at 1 and 2, chunk height 2. Leaf hashes land at the
        // slots of paths 3 and 5.
        let l1 = Blake3Hasher::hash_leaf(1, b"a", b"1");
        let l2 = Blake3Hasher::hash_leaf(2, b"b", b"2");
        let mut chunk = HashChunk::new(0, 2);
        chunk.set_hash_at_path(1, &l1);
        chunk.set_hash_at_path(2, &l2);
        assert_eq!(chunk.hash_at_path(1), l1);
        assert_eq!(chunk.hash_at_path(2), l2);
        let root = chunk.chunk_root_hash::<Blake3Hasher>(1, 2);
        assert_eq!(root, Blake3Hasher::hash_internal(&l1, &l2));
    }

    #[test]
    fn full_chunk_recomputes_internal_ranks() {
        // Chunk of height 2 entirely above the leaf boundary: slots at the deepest
        // rank are child-chunk roots, internal ranks are recomputed.
        let mut chunk = HashChunk::new(0, 2);
        let slots: Vec<Hash> = (0..4)
            .map(|i| Blake3Hasher::hash_leaf(i, b"slot", &[i as u8]))
            .collect();
        for (i, hash) in slots.iter().enumerate() {
            chunk.set_hash_at_path(3 + i as i64, hash);
        }
        let first_leaf = 100;
        let last_leaf = 200;
        let left = Blake3Hasher::hash_internal(&slots[0], &slots[1]);
        let right = Blake3Hasher::hash_internal(&slots[2], &slots[3]);
        assert_eq!(chunk.calc_hash::<Blake3Hasher>(1, first_leaf, last_leaf), left);
        assert_eq!(chunk.calc_hash::<Blake3Hasher>(2, first_leaf, last_leaf), right);
        assert_eq!(
            chunk.chunk_root_hash::<Blake3Hasher>(first_leaf, last_leaf),
            Blake3Hasher::hash_internal(&left, &right)
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut chunk = HashChunk::new(0, 3);
        for path in 7..15 {
            chunk.set_hash_at_path(path, &Blake3Hasher::hash_leaf(path, b"k", b"v"));
        }
        let decoded = HashChunk::decode(&chunk.encode(), 3).unwrap();
        assert_eq!(chunk, decoded);
    }

    #[test]
    fn packed_partial_chunk_round_trips() {
        // Only rank 1 populated: the encoded form carries two hashes, not eight.
        let mut chunk = HashChunk::new(0, 3);
        chunk.set_hash_at_path(1, &Blake3Hasher::hash_leaf(1, b"k1", b"v1"));
        chunk.set_hash_at_path(2, &Blake3Hasher::hash_leaf(2, b"k2", b"v2"));
        let bytes = chunk.encode();
        assert_eq!(bytes.len(), 1 + 8 + 4 + 2 * HASH_SIZE);
        let decoded = HashChunk::decode(&bytes, 3).unwrap();
        assert_eq!(chunk, decoded);
    }

    #[test]
    fn oversized_chunk_rejected() {
        let chunk = HashChunk::new(0, 3);
        let bytes = chunk.encode();
        // Decoding under a smaller height must reject the hash count.
        assert!(HashChunk::decode(&bytes, 3).is_ok());
        let mut oversized = HashChunk::new(0, 4);
        oversized.set_hash_at_path(left_grand_child(0, 4), &[1; 32]);
        for path in 15..31 {
            oversized.set_hash_at_path(path, &[2; 32]);
        }
        assert!(HashChunk::decode(&oversized.encode(), 3).is_err());
    }
}
