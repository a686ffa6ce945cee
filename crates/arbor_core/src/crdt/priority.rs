//! Priority queue used during tree resolution.
//!
//! Attachment candidates are drained highest-priority-first. Entries sharing
//! a priority come back in insertion order, so the drain order is fully
//! determined by how the caller fed the builder.

use std::collections::{BTreeMap, VecDeque};

/// Accumulates `(priority, item)` entries before draining.
#[derive(Debug)]
pub struct PriorityQueueBuilder<T> {
    buckets: BTreeMap<i64, VecDeque<T>>,
    len: usize,
}

impl<T> Default for PriorityQueueBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueueBuilder<T> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    /// Add an entry with the given priority.
    pub fn add_entry(&mut self, priority: i64, item: T) {
        self.buckets.entry(priority).or_default().push_back(item);
        self.len += 1;
    }

    /// Number of entries added so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no entries were added.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish building and return the drainable queue.
    pub fn build(self) -> PriorityQueue<T> {
        PriorityQueue {
            buckets: self.buckets,
            len: self.len,
        }
    }
}

/// Drains entries in descending priority order.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    buckets: BTreeMap<i64, VecDeque<T>>,
    len: usize,
}

impl<T> PriorityQueue<T> {
    /// Remove and return the highest-priority entry, FIFO within a bucket.
    pub fn pop(&mut self) -> Option<(i64, T)> {
        let (&priority, bucket) = self.buckets.iter_mut().next_back()?;
        let item = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(&priority);
        }
        self.len -= 1;
        item.map(|item| (priority, item))
    }

    /// Remaining entry count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the queue has been fully drained.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Iterator for PriorityQueue<T> {
    type Item = (i64, T);

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}
