//! Teacher/learner tree synchronization.
//!
//! A session streams only the divergent parts of the teacher's tree to the learner:
//! the teacher walks its snapshot breadth-first, shipping each node as a
//! [`lesson::Lesson`] unless the learner has confirmed it already holds a
//! hash-identical subtree there. Everything runs inside a [`work_group`], so the
//! first failure on either side abandons the whole session; there is no partial
//! success.

pub mod lesson;
pub mod stats;
pub mod streams;
pub mod view;
pub mod work_group;

mod learner;
mod teacher;

pub use learner::learn;
pub use stats::TransferStats;
pub use teacher::teach;
pub use view::{
    LearnerView, MapLearnerView, SubtreeLearnerView, SubtreeTeacherView, TeacherView,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use virtmap_core::Hash;

/// Run a complete in-process session between a teacher view and a learner view,
/// connected by a pair of in-memory pipes. Returns the learner's reconstructed
/// session root hash, which on success equals the teacher's.
pub fn reconnect<V, L>(view: &V, learner: &mut L, stats: &TransferStats) -> Result<Hash>
where
    V: TeacherView,
    L: LearnerView + Send,
{
    let (teacher_out, learner_in) = streams::pipe();
    let (learner_out, teacher_in) = streams::pipe();
    let learner_root = Mutex::new(None);
    tracing::debug!(root_path = view.root_path(), "starting sync session");
    work_group::run(vec![
        Box::new(|_| teach(view, teacher_in, teacher_out, stats)),
        Box::new(|_| {
            let root = learn(learner, learner_in, learner_out)?;
            *learner_root.lock() = Some(root);
            Ok(())
        }),
    ])?;
    let root = learner_root
        .into_inner()
        .context("session ended without a learner result")?;
    tracing::info!(
        root = %hex::encode(root),
        up_to_date = stats.up_to_date_lessons(),
        leaves = stats.leaf_lessons(),
        internals = stats.internal_lessons(),
        redundant = stats.redundant_children(),
        bytes = stats.bytes_sent(),
        "sync session finished"
    );
    Ok(root)
}
