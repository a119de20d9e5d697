//! Error taxonomy surfaced through every fallible entry point of this crate.

use std::fmt;

/// Errors produced by the queued-synchronizer kernel and the primitives built on it.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A negative timeout other than "infinite" (`None`) was supplied, or a negative count.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The caller's cancellation token fired before the lock was acquired.
    #[error("acquire was cancelled")]
    Cancelled,

    /// The caller's timeout elapsed before the lock was acquired.
    #[error("acquire timed out")]
    Timeout,

    /// The primitive has been disposed, or a disposal began while this acquisition was
    /// in flight.
    #[error("primitive has been disposed")]
    Disposed,

    /// A contract violation that isn't a caller/timeout condition: releasing a lock that
    /// isn't held, signalling a countdown event already at zero, and similar misuse.
    #[error("synchronization fault: {0}")]
    SynchronizationFault(String),

    /// A queued caller was terminated out from under it by a writer-steal or a countdown
    /// reset, carrying the reason given by the interrupter.
    #[error("interrupted: {0}")]
    Interrupted(InterruptReason),

    /// An operation is not valid for the primitive's current state (e.g. adding count to
    /// a countdown event that has already reached zero).
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// The reason an interrupted caller was torn out of the wait queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// A write-lock steal interrupted this caller.
    WriteSteal(String),
    /// A countdown event was reset while this caller was waiting on it.
    CountdownReset,
    /// A caller-supplied reason passed to `cancel_suspended_callers`.
    Custom(String),
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::WriteSteal(reason) => write!(f, "write-steal: {reason}"),
            InterruptReason::CountdownReset => write!(f, "countdown reset"),
            InterruptReason::Custom(reason) => write!(f, "{reason}"),
        }
    }
}

/// Convenience alias for this crate's `Result`.
pub type Result<T> = std::result::Result<T, SyncError>;
