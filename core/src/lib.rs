//! Core operations and types for the virtmap storage engine.
//!
//! This crate defines the identity scheme of the dense virtual merkle tree (integer
//! paths, hash chunks) together with the record codecs and the node hashing schema,
//! in a backend-agnostic manner. Nothing in here performs I/O.

pub mod chunk;
pub mod hasher;
pub mod path;
pub mod records;

pub use chunk::HashChunk;
pub use hasher::{Hash, TreeHasher, HASH_SIZE, NULL_HASH};
pub use records::{CodecError, VirtualHashRecord, VirtualLeafBytes};
