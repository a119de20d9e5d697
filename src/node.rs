//! One suspended caller.
//!
//! A [`WaitNode`] is a reusable, reference-counted completion slot. It moves through three
//! owners over its life — the [`crate::queue::WaitQueue`] it is enqueued on, the pending
//! `NodeWait` future (defined in `crate::kernel`) awaiting it, and finally the
//! [`crate::pool::NodePool`] it is returned to — but there is never more than one owner
//! mutating its queue linkage at a time, because that linkage (and the node's context)
//! only changes while the primitive's mutex is held.

use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::Instant;

use crate::error::InterruptReason;
use crate::metrics::CallerInfo;

/// The terminal result of a suspended acquire, set exactly once by whichever of "drain" or
/// "timeout/cancel" observes the node first. This is the sentinel described in the data
/// model: the kernel tells these two cases apart by which branch's `complete` call
/// returned `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// A release's drain signalled this node; it now owns the lock. The node's `context`
    /// carries which mode/value it was admitted with.
    Acquired,
    /// The timeout raced ahead of any signal.
    TimedOut,
    /// The cancellation token fired before any signal.
    Cancelled,
    /// A writer-steal or countdown reset tore this node out of the queue.
    Interrupted,
    /// The primitive was disposed while this node was queued.
    Disposed,
}

#[derive(Debug, Default)]
struct NodeState {
    outcome: Option<Outcome>,
    interrupt_reason: Option<InterruptReason>,
    waker: Option<Waker>,
}

/// A pooled, reusable wait-node. See the module docs for its ownership lifecycle.
#[derive(Debug)]
pub(crate) struct WaitNode<Ctx> {
    state: Mutex<NodeState>,
    context: Mutex<Option<Ctx>>,
    created_at: Mutex<Instant>,
    caller_info: Mutex<Option<CallerInfo>>,
}

impl<Ctx> WaitNode<Ctx> {
    fn new() -> Self {
        Self {
            state: Mutex::new(NodeState::default()),
            context: Mutex::new(None),
            created_at: Mutex::new(Instant::now()),
            caller_info: Mutex::new(None),
        }
    }

    /// Create a fresh, pool-backed node handle.
    pub(crate) fn fresh() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Reset a pooled node for reuse. Must only be called on a node with no other owner
    /// (i.e. popped from the free list, where the strong count is 1).
    pub(crate) fn reset(&self, caller_info: Option<CallerInfo>) {
        *self.state.lock().expect("wait-node state poisoned") = NodeState::default();
        *self.context.lock().expect("wait-node context poisoned") = None;
        *self.created_at.lock().expect("wait-node timestamp poisoned") = Instant::now();
        *self.caller_info.lock().expect("wait-node caller-info poisoned") = caller_info;
    }

    /// Set the caller context this node was enqueued with. Only ever called under the
    /// owning primitive's mutex, before the node is pushed onto the queue or shared with
    /// any other task.
    pub(crate) fn set_context(&self, ctx: Ctx) {
        *self.context.lock().expect("wait-node context poisoned") = Some(ctx);
    }

    /// The context this node was enqueued with. Only meaningful once `set_context` has
    /// run; read by the drain loop (under the primitive's mutex) and by the awaiting
    /// future once it observes an `Acquired` outcome.
    pub(crate) fn context(&self) -> Ctx
    where
        Ctx: Clone,
    {
        self.context
            .lock()
            .expect("wait-node context poisoned")
            .clone()
            .expect("context read before it was set")
    }

    /// Timestamp taken when this node was enqueued, used for duration metrics.
    pub(crate) fn created_at(&self) -> Instant {
        *self.created_at.lock().expect("wait-node timestamp poisoned")
    }

    /// Opaque debug payload captured at enqueue, if any.
    pub(crate) fn caller_info(&self) -> Option<CallerInfo> {
        self.caller_info.lock().expect("wait-node caller-info poisoned").clone()
    }

    /// Attempt to transition this node to a terminal outcome. Idempotent: returns `true`
    /// only for the call that actually performed the transition. Never runs the awaiter's
    /// continuation inline — it only wakes a `Waker`, which schedules resumption on the
    /// executor.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        self.complete_with_reason(outcome, None)
    }

    /// Like [`Self::complete`], additionally recording the reason for an `Interrupted`
    /// outcome.
    pub(crate) fn complete_with_reason(
        &self,
        outcome: Outcome,
        reason: Option<InterruptReason>,
    ) -> bool {
        let waker = {
            let mut state = self.state.lock().expect("wait-node state poisoned");
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.interrupt_reason = reason;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// `true` once this node has a terminal outcome (signalled, timed out, cancelled,
    /// interrupted, or disposed).
    pub(crate) fn is_terminal(&self) -> bool {
        self.state.lock().expect("wait-node state poisoned").outcome.is_some()
    }

    /// Peek the current outcome without registering a waker. Used by cleanup paths that
    /// only care whether a concurrent drain already won the race.
    pub(crate) fn terminal_outcome(&self) -> Option<(Outcome, Option<InterruptReason>)> {
        let state = self.state.lock().expect("wait-node state poisoned");
        state.outcome.map(|outcome| (outcome, state.interrupt_reason.clone()))
    }

    /// Poll-time accessor: returns the outcome (and, for `Interrupted`, its reason) if
    /// terminal, registering `waker` otherwise.
    pub(crate) fn poll_outcome(&self, waker: &Waker) -> Option<(Outcome, Option<InterruptReason>)> {
        let mut state = self.state.lock().expect("wait-node state poisoned");
        match state.outcome {
            Some(outcome) => Some((outcome, state.interrupt_reason.clone())),
            None => {
                state.waker = Some(waker.clone());
                None
            }
        }
    }
}
