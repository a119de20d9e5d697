//! A broadcast countdown latch: callers wait for a shared counter to reach zero.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{InterruptReason, Result, SyncError};
use crate::kernel::{DrainMode, LockManager, QueuedSynchronizer};
use crate::metrics::{CallerInfo, MetricsSink};

#[derive(Debug, Default)]
struct State {
    current: i64,
    initial: i64,
}

struct Manager;

impl LockManager for Manager {
    type State = State;
    type Context = ();

    fn name(&self) -> &'static str {
        "CountdownEvent"
    }

    fn is_lock_allowed(&self, _ctx: &(), state: &State) -> bool {
        state.current == 0
    }

    fn acquire_lock(&self, _ctx: &(), _state: &mut State) {
        // Reaching zero is observed, never consumed — every waiter that is admissible
        // when a drain runs is signalled, and the counter itself isn't touched here.
    }

    fn release_lock(&self, _ctx: &(), _state: &mut State) {
        // `signal` mutates `current` directly through `transform_state`; there is no
        // separate "release" concept for a countdown event.
    }

    fn requires_empty_queue(&self) -> bool {
        // Reaching zero must wake every waiter, not just a FIFO-ordered head — the
        // queue is drained by broadcast regardless of arrival order.
        false
    }

    fn drain_mode(&self) -> DrainMode {
        DrainMode::Broadcast
    }

    fn is_ready_to_dispose(&self, state: &State) -> bool {
        state.current == 0
    }
}

/// A countdown latch: any number of callers can await the shared counter reaching zero,
/// and any number of callers can decrement it (by any amount) via [`Self::signal`].
pub struct CountdownEvent {
    sync: QueuedSynchronizer<Manager>,
}

impl CountdownEvent {
    pub fn new(initial: i64, concurrency_hint: usize) -> Self {
        Self {
            sync: QueuedSynchronizer::new(
                Manager,
                State {
                    current: initial,
                    initial,
                },
                concurrency_hint,
            ),
        }
    }

    pub fn with_metrics(initial: i64, concurrency_hint: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            sync: QueuedSynchronizer::with_metrics(
                Manager,
                State {
                    current: initial,
                    initial,
                },
                concurrency_hint,
                metrics,
            ),
        }
    }

    /// Current remaining count.
    pub fn current_count(&self) -> i64 {
        self.sync.with_state(|s| s.current)
    }

    /// The count this event was constructed (or last reset) with.
    pub fn initial_count(&self) -> i64 {
        self.sync.with_state(|s| s.initial)
    }

    /// Decrement the counter by `n` (`n >= 1`). Returns `true` iff this call drove the
    /// counter to zero (and so triggered the broadcast wake-up).
    pub fn signal(&self, n: i64) -> Result<bool> {
        if n < 1 {
            return Err(SyncError::Argument(
                "signal count must be at least 1".into(),
            ));
        }
        self.sync.transform_state(|state| {
            if state.current <= 0 {
                return Err(SyncError::SynchronizationFault(
                    "signal called on a countdown event already at zero".into(),
                ));
            }
            state.current = (state.current - n).max(0);
            Ok(state.current == 0)
        })
    }

    /// Increment the counter by `n` (`n >= 0`), as long as it hasn't already reached
    /// zero. Returns `false` (without mutating) once the count has reached zero.
    pub fn try_add_count(&self, n: i64) -> Result<bool> {
        if n < 0 {
            return Err(SyncError::Argument("add count must not be negative".into()));
        }
        self.sync.transform_state(|state| {
            if state.current == 0 {
                return Ok(false);
            }
            state.current = state
                .current
                .checked_add(n)
                .ok_or_else(|| SyncError::InvalidState("countdown counter overflow".into()))?;
            Ok(true)
        })
    }

    /// Like [`Self::try_add_count`] but surfaces `InvalidState` instead of `false` when
    /// the event has already reached zero.
    pub fn add_count(&self, n: i64) -> Result<()> {
        match self.try_add_count(n)? {
            true => Ok(()),
            false => Err(SyncError::InvalidState(
                "add_count called on a countdown event already at zero".into(),
            )),
        }
    }

    /// Reset the counter back to its original initial value. Any currently-suspended
    /// waiters are interrupted with [`InterruptReason::CountdownReset`] — a reset never
    /// resumes a waiter as if the count had reached zero.
    pub fn reset(&self) {
        let initial = self.initial_count();
        self.reset_to(initial);
    }

    /// Reset the counter to `count`, also becoming the new initial value.
    pub fn reset_to(&self, count: i64) {
        self.sync.interrupt_all(InterruptReason::CountdownReset);
        self.sync.transform_state(|state| {
            state.current = count;
            state.initial = count;
        });
    }

    /// Wait for the counter to reach zero.
    pub async fn wait_async(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        self.sync.acquire((), timeout, token, None).await?;
        Ok(())
    }

    /// Like [`Self::wait_async`] but attaching `caller_info` for diagnostics.
    pub async fn wait_async_with_caller_info(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
        caller_info: CallerInfo,
    ) -> Result<()> {
        self.sync.acquire((), timeout, token, Some(caller_info)).await?;
        Ok(())
    }

    /// Signal one unit, then wait for the event's *next* reach-zero — not necessarily
    /// the one this call itself may have caused, matching the externally-observable
    /// contract rather than special-casing the synchronous-signal case.
    pub async fn signal_and_wait_async(
        &self,
        timeout: Option<Duration>,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        self.signal(1)?;
        self.wait_async(timeout, token).await
    }

    pub fn cancel_suspended_callers(&self, reason: impl Into<String>) -> usize {
        self.sync.interrupt_all(InterruptReason::Custom(reason.into()))
    }

    pub fn queue_len(&self) -> usize {
        self.sync.queue_len()
    }

    pub fn dispose(&self) {
        self.sync.dispose();
    }

    pub async fn dispose_async(&self) {
        self.sync.dispose_async().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.sync.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_below_zero_does_not_wake() {
        let event = CountdownEvent::new(3, 4);
        assert!(!event.signal(1).unwrap());
        assert_eq!(event.current_count(), 2);
    }

    #[tokio::test]
    async fn broadcast_wakes_all_waiters_on_reach_zero() {
        let event = Arc::new(CountdownEvent::new(3, 4));

        let mut waiters = Vec::new();
        for _ in 0..2 {
            let event = event.clone();
            waiters.push(tokio::spawn(async move { event.wait_async(None, None).await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!event.signal(1).unwrap());
        assert_eq!(event.current_count(), 2);
        for waiter in &waiters {
            assert!(!waiter.is_finished());
        }

        assert!(event.signal(2).unwrap());
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(event.current_count(), 0);
        assert!(!event.try_add_count(1).unwrap());
    }

    #[tokio::test]
    async fn signal_past_zero_is_a_fault() {
        let event = CountdownEvent::new(1, 1);
        assert!(event.signal(1).unwrap());
        let err = event.signal(1).unwrap_err();
        assert!(matches!(err, SyncError::SynchronizationFault(_)));
    }

    #[tokio::test]
    async fn reset_interrupts_suspended_waiters() {
        let event = Arc::new(CountdownEvent::new(2, 4));
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait_async(None, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        event.reset_to(5);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Interrupted(InterruptReason::CountdownReset)
        ));
        assert_eq!(event.current_count(), 5);
        assert_eq!(event.initial_count(), 5);
    }

    #[tokio::test]
    async fn zero_count_constructed_ready_is_already_satisfied() {
        let event = CountdownEvent::new(0, 1);
        event.wait_async(Some(Duration::from_millis(5)), None).await.unwrap();
    }
}
