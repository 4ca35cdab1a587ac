//! Library error taxonomy.
//!
//! Only caller misuse surfaces as `Err` (fire-and-forget posting semantics):
//! rate limiting, quota, blocked channels and races are silent outcomes with
//! diagnostic counters, never errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed enqueue request; surfaced synchronously, no state mutated.
    #[error("invalid enqueue request: {0}")]
    InvalidArgument(String),
}

/// Why an enqueue was silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Sliding-window enqueue rate exceeded.
    RateLimited,
    /// Package already at its live-notification cap.
    OverQuota,
    /// Package or channel is blocked by policy.
    Blocked,
    /// Referenced channel does not exist and cannot be defaulted.
    NoChannel,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted; the post will run asynchronously.
    Enqueued,
    /// A pending snooze exists for this key; the update was re-routed into
    /// the snooze store instead of being posted.
    Snoozed,
    /// Silently dropped.
    Dropped(DropReason),
}

/// Result of a cancel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Record removed and observers notified.
    Removed,
    /// Record was only in the snooze store; removed without an event.
    RemovedFromSnooze,
    /// Flag preconditions failed; record untouched.
    Rejected,
    /// Lifetime-extended record: removal suppressed, silent re-post issued,
    /// retry scheduled.
    Suppressed,
    /// No matching record anywhere; expected under races, not an error.
    NoOp,
}
