//! Dispatch queue — a priority heap over runnable tasks.
//!
//! Ordering is priority first, then submission order within a priority
//! level. Entries that get skipped (paused job, per-job limit reached) are
//! reinserted with their original sequence number so their place in line
//! is preserved.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::task::{TaskId, TaskPriority};

/// One queued dispatch candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    /// Monotonic enqueue counter, used as the FIFO tie-breaker.
    pub sequence: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins; within a level, lower sequence wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of dispatchable tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task, assigning it the next sequence number.
    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueueEntry {
            task_id,
            priority,
            sequence,
        });
    }

    /// Put a popped entry back without disturbing its place in line.
    pub fn reinsert(&mut self, entry: QueueEntry) {
        self.heap.push(entry);
    }

    /// Remove and return the highest-priority entry.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
