//! Per-primitive reusable store of [`WaitNode`] handles, eliminating allocation on the
//! hot acquire/release path once the pool has warmed up to the primitive's steady-state
//! concurrency.

use std::sync::{Arc, Mutex};

use crate::node::WaitNode;

pub(crate) struct NodePool<Ctx> {
    free: Mutex<Vec<Arc<WaitNode<Ctx>>>>,
    capacity_hint: usize,
}

impl<Ctx> NodePool<Ctx> {
    pub(crate) fn new(capacity_hint: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity_hint)),
            capacity_hint,
        }
    }

    /// Pop a free node, resetting it for reuse, or allocate a new one.
    pub(crate) fn rent(&self, caller_info: Option<crate::metrics::CallerInfo>) -> Arc<WaitNode<Ctx>> {
        let popped = self.free.lock().expect("node pool poisoned").pop();
        match popped {
            Some(node) => {
                node.reset(caller_info);
                node
            }
            None => {
                let node = WaitNode::fresh();
                node.reset(caller_info);
                node
            }
        }
    }

    /// Return a node to the free list once its last non-pool owner has dropped it.
    /// A node with other live owners (still referenced by a queue or a pending future)
    /// is rejected — the caller is expected to only call this once it has observed a
    /// terminal outcome and detached the node from the queue.
    pub(crate) fn return_node(&self, node: Arc<WaitNode<Ctx>>) {
        debug_assert!(node.is_terminal(), "returned node must be terminal");
        if Arc::strong_count(&node) != 1 {
            // Another owner (still-resident queue entry, or a second observer racing the
            // same cleanup) is holding this node; let whichever owner drops last skip the
            // return rather than double-pool it.
            return;
        }
        let mut free = self.free.lock().expect("node pool poisoned");
        if free.len() < self.capacity_hint.max(1) * 4 {
            free.push(node);
        }
        // Past a generous multiple of the capacity hint we simply let the node drop,
        // rather than let the pool grow unbounded under a burst.
    }

    #[cfg(test)]
    pub(crate) fn free_count(&self) -> usize {
        self.free.lock().expect("node pool poisoned").len()
    }
}
