//! Observability hooks.
//!
//! The core only ships the hook, not a backend: `MetricsSink` is implemented by whatever
//! metrics library the embedding application already uses. [`NoopMetrics`] is the default
//! for primitives constructed without an explicit sink.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Tag set attached to a metrics observation; kept minimal and allocation-free on the
/// common path.
#[derive(Debug, Clone, Copy)]
pub struct MetricTags {
    /// Name of the concrete primitive reporting the observation (e.g. `"ExclusiveLock"`).
    pub primitive: &'static str,
}

/// A sink for the two counters this crate reports: suspended-caller count and
/// lock-hold duration. Both methods may be no-ops.
pub trait MetricsSink: fmt::Debug + Send + Sync {
    /// Called once per enqueue with `n = 1`.
    fn counter_add(&self, name: &'static str, n: i64, tags: MetricTags);

    /// Called once a node is consumed (signalled, timed out, cancelled, or disposed),
    /// with the wall-clock time it spent suspended.
    fn histogram_record(&self, name: &'static str, value: Duration, tags: MetricTags);
}

/// A [`MetricsSink`] that discards every observation. Used when a primitive is built
/// without an explicit sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn counter_add(&self, _name: &'static str, _n: i64, _tags: MetricTags) {}
    fn histogram_record(&self, _name: &'static str, _value: Duration, _tags: MetricTags) {}
}

pub(crate) fn noop_sink() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// Opaque debug payload attached to a node at enqueue time, surfaced by
/// [`crate::kernel::QueuedSynchronizer::suspended_callers`] in diagnostic builds.
#[derive(Debug, Clone)]
pub struct CallerInfo {
    /// Free-form tag supplied by the caller (task name, request id, ...).
    pub tag: String,
}

impl CallerInfo {
    /// Build a caller-info payload from any displayable tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}
