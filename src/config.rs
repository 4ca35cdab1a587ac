//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a `NotificationPipeline` instance.
///
/// Defaults match the host platform behavior; tests shrink the windows to
/// keep runtimes low.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Sparse singleton count that triggers auto-grouping (K).
    pub sparse_group_threshold: usize,
    /// Grace delay before orphaned group children are cancelled after their
    /// summary disappeared out from under them.
    pub cascade_grace: Duration,
    /// Forced-grouping host policy: every ungrouped notification is put into
    /// a synthetic group after `force_grouping_grace`.
    pub force_grouping: bool,
    pub force_grouping_grace: Duration,
    /// Delay window granted to a registered assistant before post runs.
    pub assistant_window: Duration,
    /// Grace before a suppressed (lifetime-extended) cancel is retried.
    pub lifetime_extension_grace: Duration,
    /// Sliding-window enqueue rate limit, per (package, user).
    pub enqueue_rate_window: Duration,
    pub max_enqueues_per_window: usize,
    /// Maximum non-exempt live notifications per (package, user).
    pub max_live_per_package: usize,
    /// Snooze store capacity per user.
    pub snooze_capacity_per_user: usize,
    /// Rank strictly by post time instead of interruption-reset ranking time.
    pub sort_by_post_time: bool,
    /// TTL applied to records that do not carry their own.
    pub default_ttl: Option<Duration>,
    /// History JSONL path; `None` disables history logging.
    pub history_path: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            sparse_group_threshold: 3,
            cascade_grace: Duration::from_secs(3),
            force_grouping: false,
            force_grouping_grace: Duration::from_secs(3),
            assistant_window: Duration::from_millis(200),
            lifetime_extension_grace: Duration::from_millis(200),
            enqueue_rate_window: Duration::from_secs(1),
            max_enqueues_per_window: 10,
            max_live_per_package: 25,
            snooze_capacity_per_user: 500,
            sort_by_post_time: false,
            default_ttl: None,
            history_path: None,
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sparse_threshold(mut self, k: usize) -> Self {
        self.sparse_group_threshold = k;
        self
    }

    pub fn with_cascade_grace(mut self, grace: Duration) -> Self {
        self.cascade_grace = grace;
        self
    }

    pub fn with_force_grouping(mut self, enabled: bool, grace: Duration) -> Self {
        self.force_grouping = enabled;
        self.force_grouping_grace = grace;
        self
    }

    pub fn with_assistant_window(mut self, window: Duration) -> Self {
        self.assistant_window = window;
        self
    }

    pub fn with_rate_limit(mut self, window: Duration, max: usize) -> Self {
        self.enqueue_rate_window = window;
        self.max_enqueues_per_window = max;
        self
    }

    pub fn with_max_live_per_package(mut self, max: usize) -> Self {
        self.max_live_per_package = max;
        self
    }

    pub fn with_sort_by_post_time(mut self, enabled: bool) -> Self {
        self.sort_by_post_time = enabled;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_history_path(mut self, path: PathBuf) -> Self {
        self.history_path = Some(path);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = HubConfig::default();
        assert_eq!(cfg.sparse_group_threshold, 3);
        assert_eq!(cfg.max_live_per_package, 25);
        assert!(!cfg.force_grouping);
        assert!(cfg.history_path.is_none());
    }

    #[test]
    fn test_builders() {
        let cfg = HubConfig::new()
            .with_sparse_threshold(2)
            .with_rate_limit(Duration::from_millis(100), 5)
            .with_force_grouping(true, Duration::from_millis(50));
        assert_eq!(cfg.sparse_group_threshold, 2);
        assert_eq!(cfg.max_enqueues_per_window, 5);
        assert!(cfg.force_grouping);
    }
}
