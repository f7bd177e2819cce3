//! Node hashing schema for the virtual tree, generalized over a 256-bit hash function.
//!
//! A leaf hash covers the leaf's path, key and value; an internal hash covers the
//! concatenation of the two child hashes. The two cases are domain-separated by a
//! prefix byte so a leaf can never collide with an internal node.

/// A node hash. Always 256 bits.
pub type Hash = [u8; 32];

/// The byte length of a [`Hash`].
pub const HASH_SIZE: usize = 32;

/// The hash standing in for a node that does not exist, e.g. the right child of the
/// root in a single-leaf tree. Also the root hash of an empty tree.
pub const NULL_HASH: Hash = [0u8; 32];

const LEAF_DOMAIN: u8 = 0x00;
const INTERNAL_DOMAIN: u8 = 0x01;

/// A hasher for the virtual tree schema.
pub trait TreeHasher {
    /// Hash a leaf node given its path, key bytes and value bytes.
    fn hash_leaf(path: i64, key: &[u8], value: &[u8]) -> Hash;

    /// Hash an internal node given its two child hashes.
    fn hash_internal(left: &Hash, right: &Hash) -> Hash;
}

/// A tree hasher based on blake3.
#[cfg(feature = "blake3-hasher")]
pub struct Blake3Hasher;

#[cfg(feature = "blake3-hasher")]
impl TreeHasher for Blake3Hasher {
    fn hash_leaf(path: i64, key: &[u8], value: &[u8]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[LEAF_DOMAIN]);
        hasher.update(&path.to_le_bytes());
        hasher.update(&(key.len() as u32).to_le_bytes());
        hasher.update(key);
        hasher.update(value);
        *hasher.finalize().as_bytes()
    }

    fn hash_internal(left: &Hash, right: &Hash) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[INTERNAL_DOMAIN]);
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }
}

/// A tree hasher based on SHA-256.
#[cfg(feature = "sha2-hasher")]
pub struct Sha2Hasher;

#[cfg(feature = "sha2-hasher")]
impl TreeHasher for Sha2Hasher {
    fn hash_leaf(path: i64, key: &[u8], value: &[u8]) -> Hash {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update([LEAF_DOMAIN]);
        hasher.update(path.to_le_bytes());
        hasher.update((key.len() as u32).to_le_bytes());
        hasher.update(key);
        hasher.update(value);
        hasher.finalize().into()
    }

    fn hash_internal(left: &Hash, right: &Hash) -> Hash {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update([INTERNAL_DOMAIN]);
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_and_internal_never_collide() {
        let leaf = Blake3Hasher::hash_leaf(1, b"key", b"value");
        let internal = Blake3Hasher::hash_internal(&leaf, &NULL_HASH);
        assert_ne!(leaf, internal);
        assert_ne!(leaf, NULL_HASH);
    }

    #[test]
    fn key_length_is_unambiguous() {
        // `("ab", "c")` and `("a", "bc")` must hash differently.
        let a = Blake3Hasher::hash_leaf(5, b"ab", b"c");
        let b = Blake3Hasher::hash_leaf(5, b"a", b"bc");
        assert_ne!(a, b);
    }
}
