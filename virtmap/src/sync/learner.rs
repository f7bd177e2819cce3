//! The learner half of a sync session.
//!
//! A single task drives the whole side: it announces its root hash, then works
//! through its expectation queue, reading exactly one lesson per expected node. An
//! internal lesson's queries are answered in strict child order against the
//! learner's pre-session tree, and each queried child becomes a new expectation. The
//! learner mutates its map in place as leaf lessons arrive and rehashes once the
//! queue drains.

use super::lesson::{read_lesson, write_response, write_root_hash, Lesson};
use super::view::LearnerView;
use anyhow::{ensure, Result};
use std::collections::VecDeque;
use std::io::{Read, Write};
use virtmap_core::path::left_child;
use virtmap_core::Hash;

/// Run the learner side of a session over the given stream pair. Returns the
/// reconstructed session root hash; the caller hands it (and the map) back to
/// whatever orchestrated the reconnect.
pub fn learn<L, R, W>(view: &mut L, input: R, output: W) -> Result<Hash>
where
    L: LearnerView,
    R: Read,
    W: Write,
{
    let mut input = input;
    let mut output = output;
    write_root_hash(&mut output, &view.original_root_hash()?)?;
    output.flush()?;

    let root_path = view.root_path();
    let mut expectations = VecDeque::new();
    expectations.push_back(root_path);
    while let Some(path) = expectations.pop_front() {
        match read_lesson(&mut input)? {
            // Keep the node already in place.
            Lesson::UpToDate => {}
            Lesson::Leaf(leaf) => {
                ensure!(
                    leaf.path == path,
                    "leaf lesson for path {} arrived at slot {}",
                    leaf.path,
                    path
                );
                view.adopt_leaf(&leaf)?;
            }
            Lesson::Internal(internal) => {
                ensure!(
                    internal.path == path,
                    "internal lesson for path {} arrived at slot {}",
                    internal.path,
                    path
                );
                if let Some((first, last)) = internal.leaf_boundaries {
                    ensure!(
                        path == root_path,
                        "leaf boundaries on a non-root lesson at path {}",
                        path
                    );
                    view.adopt_leaf_boundaries(first, last)?;
                }
                for (offset, query) in internal.queries.iter().enumerate() {
                    let child = left_child(path) + offset as i64;
                    let known = view.original_node_hash(child)?.map_or(false, |h| h == *query);
                    write_response(&mut output, known)?;
                    expectations.push_back(child);
                }
                output.flush()?;
            }
        }
    }
    view.finish()
}
