//! Gray queue for the mark phase.
//!
//! Simple Vec-based stack of allocations that have been reached but whose
//! fields have not been scanned yet. The buffer is owned by the collector
//! state and reused across collections.

use crate::allocation::Allocation;

/// Stack of allocations pending a field scan.
pub(crate) struct GrayQueue {
    queue: Vec<Allocation>,
}

impl GrayQueue {
    /// Create a new empty gray queue.
    pub(crate) const fn new() -> GrayQueue {
        GrayQueue { queue: Vec::new() }
    }

    /// Check if the queue is empty.
    #[inline]
    #[allow(dead_code)]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Push an allocation onto the queue.
    #[inline]
    pub(crate) fn push(&mut self, allocation: Allocation) {
        self.queue.push(allocation);
    }

    /// Pop an allocation from the queue.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<Allocation> {
        self.queue.pop()
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}
