//! The queued synchronizer kernel.
//!
//! [`QueuedSynchronizer`] is the generic engine described in the design: it owns one
//! mutex, one [`WaitQueue`], one [`NodePool`], and a [`LockManager`] strategy, and from
//! those four things derives all four acquire entry shapes plus release/drain,
//! interruption, and disposal for every concrete primitive in this crate.
//!
//! The "plain" kernel and the "context" kernel from the design document are the same
//! type here, specialized by `LockManager::Context`: [`crate::exclusive_lock`] uses
//! `Context = ()`, while [`crate::rwlock`] and [`crate::countdown_event`] use a real
//! per-caller context. See `DESIGN.md` for why this unification is grounded rather than
//! invented.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{InterruptReason, Result, SyncError};
use crate::metrics::{noop_sink, CallerInfo, MetricTags, MetricsSink};
use crate::node::{Outcome, WaitNode};
use crate::pool::NodePool;
use crate::queue::WaitQueue;

/// How a primitive's release drains its wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Walk the queue from the head, stopping as soon as a node is inadmissible. Used by
    /// primitives with a notion of "holder" (exclusive lock, reader-writer lock).
    HeadOnly,
    /// Detach and signal every queued node unconditionally. Used by primitives whose
    /// release is a broadcast (countdown event reaching zero).
    Broadcast,
}

/// The pluggable per-primitive strategy consulted by [`QueuedSynchronizer`].
///
/// `Context` is the per-caller value threaded through every node (the reader-writer
/// lock's mode, or `()` when a primitive has no notion of caller-specific admission).
pub trait LockManager: Send + Sync + 'static {
    /// The primitive's own state, mutated only while the kernel's mutex is held.
    type State: Send;
    /// Per-caller value carried by each queued node.
    type Context: Clone + Send + Sync + 'static;

    /// Name used to tag metrics and log lines (e.g. `"ExclusiveLock"`).
    fn name(&self) -> &'static str;

    /// Whether `ctx` could acquire right now, given `state`.
    fn is_lock_allowed(&self, ctx: &Self::Context, state: &Self::State) -> bool;

    /// Mutate `state` to reflect `ctx` having acquired.
    fn acquire_lock(&self, ctx: &Self::Context, state: &mut Self::State);

    /// Mutate `state` to reflect `ctx` having released.
    fn release_lock(&self, ctx: &Self::Context, state: &mut Self::State);

    /// Validate a release before `release_lock` runs (e.g. "was actually held").
    fn validate_release(&self, _ctx: &Self::Context, _state: &Self::State) -> Result<()> {
        Ok(())
    }

    /// Write manager-specific fields into a context just before it is enqueued.
    fn init_node(&self, _ctx: &mut Self::Context) {}

    /// If `true` (the default), `try_acquire` fails whenever the queue is non-empty —
    /// this is what enforces FIFO. Primitives admitting broadcast wake-ups override to
    /// `false`.
    fn requires_empty_queue(&self) -> bool {
        true
    }

    /// Which drain algorithm `release` runs.
    fn drain_mode(&self) -> DrainMode {
        DrainMode::HeadOnly
    }

    /// Whether the primitive may be disposed right now (queue emptiness is already
    /// checked by the kernel; this hook covers additional conditions like "no holder").
    fn is_ready_to_dispose(&self, _state: &Self::State) -> bool {
        true
    }
}

struct Inner<M: LockManager> {
    state: M::State,
    queue: WaitQueue<M::Context>,
    disposed: bool,
}

/// The generic queued-synchronizer kernel. See the module docs.
pub struct QueuedSynchronizer<M: LockManager> {
    manager: M,
    inner: Mutex<Inner<M>>,
    pool: NodePool<M::Context>,
    metrics: Arc<dyn MetricsSink>,
    activity: tokio::sync::Notify,
}

impl<M: LockManager> fmt::Debug for QueuedSynchronizer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedSynchronizer")
            .field("name", &self.manager.name())
            .finish()
    }
}

enum EnqueueResult<Ctx> {
    Acquired(Ctx),
    Enqueued(Arc<WaitNode<Ctx>>),
}

impl<M: LockManager> QueuedSynchronizer<M> {
    /// Build a kernel around `manager`, with `concurrency_hint` sizing the node pool.
    pub fn new(manager: M, state: M::State, concurrency_hint: usize) -> Self {
        Self::with_metrics(manager, state, concurrency_hint, noop_sink())
    }

    pub fn with_metrics(
        manager: M,
        state: M::State,
        concurrency_hint: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            manager,
            inner: Mutex::new(Inner {
                state,
                queue: WaitQueue::new(),
                disposed: false,
            }),
            pool: NodePool::new(concurrency_hint.max(1)),
            metrics,
            activity: tokio::sync::Notify::new(),
        }
    }

    fn tags(&self) -> MetricTags {
        MetricTags {
            primitive: self.manager.name(),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Read-only peek at the primitive's state. Used by accessors like
    /// `ReaderWriterLock::readers()` that report current state for debugging.
    pub fn with_state<R>(&self, f: impl FnOnce(&M::State) -> R) -> R {
        let inner = self.inner.lock().expect("synchronizer mutex poisoned");
        f(&inner.state)
    }

    fn synchronous_success(&self, inner: &Inner<M>, ctx: &M::Context) -> bool {
        let queue_ok = !self.manager.requires_empty_queue() || inner.queue.is_empty();
        queue_ok && self.manager.is_lock_allowed(ctx, &inner.state)
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner<M>> {
        self.inner.lock().expect("synchronizer mutex poisoned")
    }

    /// Synchronous, non-queuing acquire.
    pub fn try_acquire(&self, ctx: M::Context) -> Result<bool> {
        let mut inner = self.lock_inner();
        if inner.disposed {
            return Err(SyncError::Disposed);
        }
        if self.synchronous_success(&inner, &ctx) {
            self.manager.acquire_lock(&ctx, &mut inner.state);
            log::trace!("{}: synchronous acquire", self.manager.name());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn enqueue(&self, mut ctx: M::Context, caller_info: Option<CallerInfo>) -> Result<EnqueueResult<M::Context>> {
        let mut inner = self.lock_inner();
        if inner.disposed {
            return Err(SyncError::Disposed);
        }
        if self.synchronous_success(&inner, &ctx) {
            self.manager.acquire_lock(&ctx, &mut inner.state);
            return Ok(EnqueueResult::Acquired(ctx));
        }
        self.manager.init_node(&mut ctx);
        let node = self.pool.rent(caller_info);
        node.set_context(ctx);
        inner.queue.push_back(node.clone());
        drop(inner);
        self.metrics.counter_add("suspended-callers", 1, self.tags());
        log::trace!("{}: enqueued, queue depth now tracked", self.manager.name());
        Ok(EnqueueResult::Enqueued(node))
    }

    /// Core async acquire shared by every public entry point that may suspend.
    ///
    /// `timeout = None` waits indefinitely (cancel-only); `timeout = Some(d)` races the
    /// suspension against `tokio::time::sleep(d)`. `token` is optional cooperative
    /// cancellation.
    pub async fn acquire(
        &self,
        ctx: M::Context,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
        caller_info: Option<CallerInfo>,
    ) -> Result<M::Context> {
        if let Some(token) = token {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
        }

        if timeout == Some(Duration::ZERO) {
            // Step 5 of the design's algorithm: a zero timeout behaves like a
            // synchronous try, without ever enqueuing.
            return match self.try_acquire(ctx.clone())? {
                true => Ok(ctx),
                false => Err(SyncError::Timeout),
            };
        }

        let node = match self.enqueue(ctx, caller_info)? {
            EnqueueResult::Acquired(ctx) => return Ok(ctx),
            EnqueueResult::Enqueued(node) => node,
        };

        let mut guard = NodeGuard {
            sync: self,
            node: node.clone(),
            done: false,
        };

        let outcome = match (timeout, token) {
            (Some(d), Some(token)) => {
                tokio::select! {
                    o = guard.wait() => o,
                    _ = token.cancelled() => Outcome::Cancelled,
                    _ = tokio::time::sleep(d) => Outcome::TimedOut,
                }
            }
            (Some(d), None) => {
                tokio::select! {
                    o = guard.wait() => o,
                    _ = tokio::time::sleep(d) => Outcome::TimedOut,
                }
            }
            (None, Some(token)) => {
                tokio::select! {
                    o = guard.wait() => o,
                    _ = token.cancelled() => Outcome::Cancelled,
                }
            }
            (None, None) => guard.wait().await,
        };

        match outcome {
            Outcome::Acquired => Ok(node.context()),
            Outcome::TimedOut => Err(SyncError::Timeout),
            Outcome::Cancelled => Err(SyncError::Cancelled),
            Outcome::Interrupted => {
                let reason = node
                    .terminal_outcome()
                    .and_then(|(_, reason)| reason)
                    .unwrap_or(InterruptReason::Custom("unknown".into()));
                Err(SyncError::Interrupted(reason))
            }
            Outcome::Disposed => Err(SyncError::Disposed),
        }
    }

    /// Release `ctx`'s hold and drain the queue for newly-admissible callers.
    pub fn release(&self, ctx: M::Context) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.disposed {
            return Err(SyncError::Disposed);
        }
        self.manager.validate_release(&ctx, &inner.state)?;
        self.manager.release_lock(&ctx, &mut inner.state);
        let signalled = self.drain_locked(&mut inner);
        drop(inner);
        log::debug!(
            "{}: release signalled {} queued caller(s)",
            self.manager.name(),
            signalled.len()
        );
        self.activity.notify_waiters();
        // Dropping `signalled` here is enough: each node was already transitioned to a
        // terminal outcome, which already woke its waiting future via `Waker::wake` (a
        // scheduling call, never an inline continuation run — see DESIGN.md).
        let _ = signalled;
        Ok(())
    }

    /// Mutate `state` directly under the kernel's mutex and then drain, without going
    /// through `validate_release`/`release_lock`. Used by primitives whose state change
    /// isn't a plain "one context releases" (countdown event's `signal`/`reset`, the
    /// reader-writer lock's `downgrade`).
    pub fn transform_state<R>(&self, f: impl FnOnce(&mut M::State) -> R) -> R {
        let mut inner = self.lock_inner();
        let result = f(&mut inner.state);
        let signalled = self.drain_locked(&mut inner);
        drop(inner);
        log::debug!(
            "{}: drain signalled {} queued caller(s)",
            self.manager.name(),
            signalled.len()
        );
        self.activity.notify_waiters();
        result
    }

    fn drain_locked(&self, inner: &mut Inner<M>) -> Vec<Arc<WaitNode<M::Context>>> {
        match self.manager.drain_mode() {
            DrainMode::HeadOnly => self.drain_head_only(inner),
            DrainMode::Broadcast => self.drain_broadcast(inner),
        }
    }

    fn drain_head_only(&self, inner: &mut Inner<M>) -> Vec<Arc<WaitNode<M::Context>>> {
        let mut signalled = Vec::new();
        loop {
            let Some(node) = inner.queue.front().cloned() else {
                break;
            };
            if node.is_terminal() {
                inner.queue.remove(&node);
                continue;
            }
            let ctx = node.context();
            if !self.manager.is_lock_allowed(&ctx, &inner.state) {
                break;
            }
            inner.queue.remove(&node);
            if !node.complete(Outcome::Acquired) {
                // A concurrent timeout/cancel won the race for this node; it has
                // already been detached above, just move on to the next one.
                continue;
            }
            self.manager.acquire_lock(&ctx, &mut inner.state);
            signalled.push(node);
        }
        signalled
    }

    /// Broadcast-complete every queued node for which the manager's admission predicate
    /// now holds, leaving the rest queued. A countdown event's `signal` that doesn't
    /// drive `current` to zero, for instance, must drain nobody — this is what makes
    /// that the case rather than waking every queued waiter on every call.
    fn drain_broadcast(&self, inner: &mut Inner<M>) -> Vec<Arc<WaitNode<M::Context>>> {
        let nodes = inner.queue.detach_all();
        let mut signalled = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.is_terminal() {
                continue;
            }
            let ctx = node.context();
            if self.manager.is_lock_allowed(&ctx, &inner.state) {
                if node.complete(Outcome::Acquired) {
                    signalled.push(node);
                }
            } else {
                inner.queue.push_back(node);
            }
        }
        signalled
    }

    /// Interrupt every currently-queued caller with `reason`, without disposing the
    /// primitive. Used by `cancel_suspended_callers` and by the reader-writer lock's
    /// write-steal.
    pub fn interrupt_all(&self, reason: InterruptReason) -> usize {
        let mut inner = self.lock_inner();
        let nodes = inner.queue.detach_all();
        drop(inner);
        let mut count = 0;
        for node in nodes {
            if node.complete_with_reason(Outcome::Interrupted, Some(reason.clone())) {
                count += 1;
            }
        }
        self.activity.notify_waiters();
        count
    }

    /// Forcibly dispose: every queued caller is completed with `Disposed` and the
    /// primitive stops accepting new acquisitions. Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.lock_inner();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        let nodes = inner.queue.detach_all();
        drop(inner);
        for node in nodes {
            node.complete(Outcome::Disposed);
        }
        log::warn!("{}: disposed", self.manager.name());
        self.activity.notify_waiters();
    }

    /// Graceful disposal: waits until the queue is empty and
    /// `LockManager::is_ready_to_dispose` holds, then disposes. Idempotent.
    pub async fn dispose_async(&self) {
        loop {
            {
                let mut inner = self.lock_inner();
                if inner.disposed {
                    return;
                }
                if inner.queue.is_empty() && self.manager.is_ready_to_dispose(&inner.state) {
                    inner.disposed = true;
                    log::warn!("{}: disposed gracefully", self.manager.name());
                    return;
                }
            }
            self.activity.notified().await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lock_inner().disposed
    }

    /// Snapshot of the currently-suspended callers' debug tags, for diagnostics.
    pub fn suspended_callers(&self) -> Vec<Option<CallerInfo>> {
        let inner = self.lock_inner();
        inner.queue.iter().map(|n| n.caller_info()).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_inner().queue.len()
    }

    fn finish_node(&self, node: Arc<WaitNode<M::Context>>) {
        {
            let mut inner = self.lock_inner();
            inner.queue.remove(&node);
        }
        let duration = node.created_at().elapsed();
        self.metrics
            .histogram_record("lock-duration", duration, self.tags());
        self.pool.return_node(node);
    }

    fn abandon(&self, node: &Arc<WaitNode<M::Context>>) {
        let own = node.complete(Outcome::Cancelled);
        if !own {
            if let Some((Outcome::Acquired, _)) = node.terminal_outcome() {
                // We won the lock, but our future is being dropped before it can hand
                // the guard back to the caller (e.g. the `timeout`/`cancelled` arm of
                // `select!` resolved first). Release immediately so it isn't leaked.
                let ctx = node.context();
                if let Err(err) = self.release(ctx) {
                    log::warn!(
                        "{}: failed to auto-release an abandoned-but-acquired node: {err}",
                        self.manager.name()
                    );
                }
            }
        }
        self.finish_node(node.clone());
    }
}

/// Bridges a rented [`WaitNode`] to a polled [`Future`], and guarantees cleanup (detach +
/// pool return, and — in the lost-race case — an auto-release) no matter how the
/// enclosing `select!` resolves.
struct NodeGuard<'a, M: LockManager> {
    sync: &'a QueuedSynchronizer<M>,
    node: Arc<WaitNode<M::Context>>,
    done: bool,
}

impl<'a, M: LockManager> NodeGuard<'a, M> {
    fn wait(&mut self) -> NodeWait<'a, '_, M> {
        NodeWait { guard: self }
    }
}

struct NodeWait<'a, 'b, M: LockManager> {
    guard: &'b mut NodeGuard<'a, M>,
}

impl<'a, 'b, M: LockManager> Future for NodeWait<'a, 'b, M> {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Outcome> {
        let this = self.get_mut();
        match this.guard.node.poll_outcome(cx.waker()) {
            Some((outcome, _)) => {
                this.guard.done = true;
                Poll::Ready(outcome)
            }
            None => Poll::Pending,
        }
    }
}

impl<'a, M: LockManager> Drop for NodeGuard<'a, M> {
    fn drop(&mut self) {
        if self.done {
            self.sync.finish_node(self.node.clone());
        } else {
            self.sync.abandon(&self.node);
        }
    }
}
