//! Write-only transfer counters for a sync session.
//!
//! The session tasks only ever increment; an orchestrator (or a test) reads the
//! totals after the session ends.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransferStats {
    up_to_date_lessons: AtomicU64,
    leaf_lessons: AtomicU64,
    internal_lessons: AtomicU64,
    queries: AtomicU64,
    responses: AtomicU64,
    // Responses confirming the learner already held a matching node.
    redundant_children: AtomicU64,
    // Lesson bytes shipped, teacher to learner.
    bytes_sent: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_up_to_date(&self) {
        self.up_to_date_lessons.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leaf(&self) {
        self.leaf_lessons.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_internal(&self, query_count: usize) {
        self.internal_lessons.fetch_add(1, Ordering::Relaxed);
        self.queries.fetch_add(query_count as u64, Ordering::Relaxed);
    }

    pub fn record_response(&self, known: bool) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        if known {
            self.redundant_children.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lesson_bytes(&self, count: usize) {
        self.bytes_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn up_to_date_lessons(&self) -> u64 {
        self.up_to_date_lessons.load(Ordering::Relaxed)
    }

    pub fn leaf_lessons(&self) -> u64 {
        self.leaf_lessons.load(Ordering::Relaxed)
    }

    pub fn internal_lessons(&self) -> u64 {
        self.internal_lessons.load(Ordering::Relaxed)
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn redundant_children(&self) -> u64 {
        self.redundant_children.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
