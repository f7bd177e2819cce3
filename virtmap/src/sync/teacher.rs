//! The teacher half of a sync session.
//!
//! Two tasks share one session: the send task walks the tree breadth-first and
//! decides, per node, between an `UP_TO_DATE` lesson and a payload lesson; the
//! receive task consumes the learner's boolean query responses and feeds them to the
//! send task through the response tracker. The send task blocks until the response
//! for the node at the front of its queue has arrived, so the walk never outruns the
//! learner.
//!
//! The session opens with the learner announcing its root hash; the receive task
//! turns that into the root's response, which is what lets two identical trees
//! settle with a single `UP_TO_DATE` lesson.

use super::lesson::{read_response, read_root_hash, write_lesson, InternalLesson, Lesson};
use super::stats::TransferStats;
use super::view::TeacherView;
use super::work_group::{self, Canceller, Task};
use anyhow::{bail, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::time::Duration;
use virtmap_core::path::{left_child, right_child};
use virtmap_core::Hash;

const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(10);
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Routes each boolean query response from the receive task to the send task's
/// decision for that path.
struct ResponseTracker {
    responses: Mutex<HashMap<i64, bool>>,
    arrived: Condvar,
}

impl ResponseTracker {
    fn new() -> Self {
        ResponseTracker {
            responses: Mutex::new(HashMap::new()),
            arrived: Condvar::new(),
        }
    }

    fn record(&self, path: i64, known: bool) {
        self.responses.lock().insert(path, known);
        self.arrived.notify_all();
    }

    /// Block until the response for `path` has arrived.
    fn wait_for(&self, path: i64, canceller: &Canceller) -> Result<bool> {
        let mut responses = self.responses.lock();
        loop {
            if let Some(known) = responses.remove(&path) {
                return Ok(known);
            }
            if canceller.is_cancelled() {
                bail!("sync session cancelled");
            }
            self.arrived
                .wait_for(&mut responses, CANCEL_CHECK_INTERVAL);
        }
    }
}

/// Run the teacher side of a session over the given stream pair. Returns once the
/// learner has confirmed or received every divergent subtree.
pub fn teach<V, R, W>(view: &V, input: R, output: W, stats: &TransferStats) -> Result<()>
where
    V: TeacherView,
    R: Read + Send,
    W: Write + Send,
{
    let teacher_root = view.root_hash()?;
    let root_path = view.root_path();
    let tracker = ResponseTracker::new();
    let (owed_tx, owed_rx) = crossbeam_channel::unbounded();
    let mut input = input;
    let mut output = output;
    let send: Task<'_> =
        Box::new(|canceller| send_lessons(view, &tracker, owed_tx, &mut output, stats, canceller));
    let receive: Task<'_> = Box::new(|canceller| {
        receive_responses(
            &tracker,
            owed_rx,
            &mut input,
            teacher_root,
            root_path,
            stats,
            canceller,
        )
    });
    work_group::run(vec![send, receive])
}

fn send_lessons<V: TeacherView, W: Write>(
    view: &V,
    tracker: &ResponseTracker,
    owed_tx: Sender<i64>,
    output: &mut W,
    stats: &TransferStats,
    canceller: &Canceller,
) -> Result<()> {
    let root_path = view.root_path();
    let (_, last_leaf_path) = view.leaf_boundaries();
    let mut queue = VecDeque::new();
    queue.push_back(root_path);
    while let Some(path) = queue.pop_front() {
        if canceller.is_cancelled() {
            return Ok(());
        }
        if tracker.wait_for(path, canceller)? {
            // The learner already holds this subtree; do not descend.
            ship_lesson(output, &Lesson::UpToDate, stats)?;
            stats.record_up_to_date();
            continue;
        }
        if view.is_leaf(path) {
            ship_lesson(output, &Lesson::Leaf(view.leaf_bytes(path)?), stats)?;
            stats.record_leaf();
            continue;
        }
        let mut queries = Vec::new();
        let mut children = Vec::new();
        for child in [left_child(path), right_child(path)] {
            if child > last_leaf_path {
                break;
            }
            queries.push(view.node_hash(child)?);
            children.push(child);
        }
        let leaf_boundaries = (path == root_path).then(|| view.leaf_boundaries());
        stats.record_internal(queries.len());
        ship_lesson(
            output,
            &Lesson::Internal(InternalLesson {
                path,
                leaf_boundaries,
                queries,
            }),
            stats,
        )?;
        for child in children {
            if owed_tx.send(child).is_err() {
                bail!("response reader exited early");
            }
            queue.push_back(child);
        }
    }
    Ok(())
}

/// Frame one lesson, count its bytes, and flush it so the learner never waits on a
/// buffered lesson.
fn ship_lesson<W: Write>(output: &mut W, lesson: &Lesson, stats: &TransferStats) -> Result<()> {
    let mut frame = Vec::new();
    write_lesson(&mut frame, lesson)?;
    output.write_all(&frame)?;
    output.flush()?;
    stats.record_lesson_bytes(frame.len());
    Ok(())
}

/// Drain one boolean response per owed path, in the exact order the send task
/// declared them. Exits only once the send task is done and every owed response has
/// been consumed, or on cancellation.
fn receive_responses<R: Read>(
    tracker: &ResponseTracker,
    owed_rx: Receiver<i64>,
    input: &mut R,
    teacher_root: Hash,
    root_path: i64,
    stats: &TransferStats,
    canceller: &Canceller,
) -> Result<()> {
    // Session preamble: the learner announces the root hash it currently holds.
    let learner_root = read_root_hash(input)?;
    tracker.record(root_path, learner_root == teacher_root);
    loop {
        match owed_rx.recv_timeout(RESPONSE_POLL_INTERVAL) {
            Ok(path) => {
                let known = read_response(input)?;
                stats.record_response(known);
                tracker.record(path, known);
            }
            Err(RecvTimeoutError::Timeout) => {
                if canceller.is_cancelled() {
                    return Ok(());
                }
            }
            // The send task dropped its end after draining its queue; nothing more
            // is owed.
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}
