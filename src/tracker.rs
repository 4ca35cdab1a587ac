//! Post permit tracking
//!
//! Every enqueue acquires a `PostPermit` before entering the asynchronous
//! pipeline and must release it exactly once on a terminal outcome
//! (posted, dropped, or cancelled). The permit is the wake-lock equivalent
//! of the host platform: as long as one is held the process is expected to
//! keep making progress on the post.
//!
//! Dropping an unreleased permit is a bug in the pipeline; the `Drop`
//! backstop still releases it (so counters stay balanced) and logs it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Shared permit counters, one set per pipeline instance.
#[derive(Debug, Default)]
pub struct PermitStats {
    acquired: AtomicU64,
    released: AtomicU64,
    leaked: AtomicU64,
}

impl PermitStats {
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn leaked(&self) -> u64 {
        self.leaked.load(Ordering::SeqCst)
    }

    /// Permits currently held.
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

/// Issues permits against a shared stats block.
#[derive(Clone, Default)]
pub struct PermitTracker {
    stats: Arc<PermitStats>,
    /// Holds longer than this get a warning when released.
    max_hold: Option<Duration>,
}

impl PermitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_hold(mut self, max_hold: Duration) -> Self {
        self.max_hold = Some(max_hold);
        self
    }

    pub fn stats(&self) -> &PermitStats {
        &self.stats
    }

    pub fn acquire(&self, key: impl Into<String>) -> PostPermit {
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        PostPermit {
            key: key.into(),
            stats: Arc::clone(&self.stats),
            acquired_at: Instant::now(),
            max_hold: self.max_hold,
            released: AtomicBool::new(false),
        }
    }
}

/// Scoped resource handle for one in-flight post.
pub struct PostPermit {
    key: String,
    stats: Arc<PermitStats>,
    acquired_at: Instant,
    max_hold: Option<Duration>,
    released: AtomicBool,
}

impl PostPermit {
    /// Release on success.
    pub fn finish(self) {
        self.release("finish");
    }

    /// Release on drop/cancel/failure.
    pub fn cancel(self) {
        self.release("cancel");
    }

    fn release(&self, how: &str) {
        if self.released.swap(true, Ordering::SeqCst) {
            // Second release is unreachable through finish/cancel (both take
            // self by value); this only guards the Drop backstop.
            return;
        }
        self.stats.released.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = self.max_hold {
            let held = self.acquired_at.elapsed();
            if held > max {
                warn!(key = %self.key, held_ms = held.as_millis() as u64, how, "Post permit held past budget");
            }
        }
    }
}

impl Drop for PostPermit {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.stats.released.fetch_add(1, Ordering::SeqCst);
            self.stats.leaked.fetch_add(1, Ordering::SeqCst);
            warn!(key = %self.key, "Post permit dropped without explicit release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_finish_balances() {
        let tracker = PermitTracker::new();
        let permit = tracker.acquire("k1");
        assert_eq!(tracker.stats().outstanding(), 1);

        permit.finish();
        assert_eq!(tracker.stats().outstanding(), 0);
        assert_eq!(tracker.stats().leaked(), 0);
    }

    #[test]
    fn test_cancel_balances() {
        let tracker = PermitTracker::new();
        tracker.acquire("k1").cancel();
        assert_eq!(tracker.stats().outstanding(), 0);
        assert_eq!(tracker.stats().leaked(), 0);
    }

    #[test]
    fn test_drop_backstop_counts_leak() {
        let tracker = PermitTracker::new();
        {
            let _permit = tracker.acquire("k1");
            // dropped without finish/cancel
        }
        assert_eq!(tracker.stats().outstanding(), 0);
        assert_eq!(tracker.stats().leaked(), 1);
    }

    #[test]
    fn test_release_on_panic_path() {
        let tracker = PermitTracker::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _permit = tracker.acquire("k1");
            panic!("boom");
        }));
        assert!(result.is_err());
        // Unwinding still releases via Drop.
        assert_eq!(tracker.stats().outstanding(), 0);
    }

    #[test]
    fn test_many_permits() {
        let tracker = PermitTracker::new();
        let permits: Vec<_> = (0..10).map(|i| tracker.acquire(format!("k{}", i))).collect();
        assert_eq!(tracker.stats().outstanding(), 10);
        for p in permits {
            p.finish();
        }
        assert_eq!(tracker.stats().outstanding(), 0);
    }
}
