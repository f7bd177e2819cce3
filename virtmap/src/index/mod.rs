//! The index layer: dense path-keyed location arrays and the bucketed key index.

pub mod key_index;
pub mod path_index;

pub use key_index::KeyIndex;
pub use path_index::PathIndex;
