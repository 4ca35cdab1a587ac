//! Policy collaborator boundary
//!
//! The pipeline never owns zen/DND state, channel preferences or block lists;
//! it consumes them through `PolicyProvider`. Snapshots are taken once per
//! post/re-rank pass so a mid-pass policy flip cannot produce a half-updated
//! ordering.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::record::{Importance, NotificationRecord};

/// Zen (do-not-disturb) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZenMode {
    #[default]
    Off,
    /// Only HIGH importance (and critical records) get through.
    PriorityOnly,
    /// Everything is intercepted except critical records.
    Total,
}

/// A notification channel as the policy layer sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub importance: Importance,
    pub blocked: bool,
}

impl ChannelInfo {
    pub fn new(id: impl Into<String>, importance: Importance) -> Self {
        Self {
            id: id.into(),
            importance,
            blocked: false,
        }
    }
}

/// Immutable policy snapshot used for one ranking pass.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub zen: ZenMode,
    /// Per-channel importance overrides, keyed by `"package:channel_id"`.
    pub channel_importance: HashMap<String, Importance>,
}

/// What the pipeline needs from the host policy sources.
pub trait PolicyProvider: Send + Sync {
    /// Whether posts from this package/channel are blocked outright.
    fn is_blocked(&self, package: &str, channel_id: &str) -> bool;

    /// Current policy snapshot.
    fn snapshot(&self) -> PolicySnapshot;

    /// Resolve the effective channel, or `None` when it does not exist and
    /// cannot be defaulted.
    fn resolve_channel(&self, package: &str, user_id: i32, channel_id: &str) -> Option<ChannelInfo>;

    /// Whether the record is suppressed from alerting by the snapshot.
    ///
    /// Records with negative criticality are treated as critical and are
    /// never intercepted.
    fn should_intercept(&self, record: &NotificationRecord, snapshot: &PolicySnapshot) -> bool {
        if record.criticality < 0 {
            return false;
        }
        match snapshot.zen {
            ZenMode::Off => false,
            ZenMode::PriorityOnly => record.importance < Importance::High,
            ZenMode::Total => true,
        }
    }
}

#[derive(Default)]
struct StaticPolicyInner {
    zen: ZenMode,
    /// `"package:channel_id"` -> channel
    channels: HashMap<String, ChannelInfo>,
    blocked_packages: HashSet<String>,
    channel_importance: HashMap<String, Importance>,
}

/// In-memory policy source with a mutable handle. Used by the demo binary and
/// tests; a host OS integration implements `PolicyProvider` against its own
/// preference storage instead.
#[derive(Clone, Default)]
pub struct StaticPolicy {
    inner: Arc<RwLock<StaticPolicyInner>>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for a package. Packages without any registered
    /// channel resolve everything to a DEFAULT-importance channel, which
    /// keeps single-purpose tests terse.
    pub fn add_channel(&self, package: &str, channel: ChannelInfo) {
        let mut inner = self.inner.write().expect("policy lock poisoned");
        inner
            .channels
            .insert(format!("{}:{}", package, channel.id), channel);
    }

    pub fn block_package(&self, package: &str) {
        let mut inner = self.inner.write().expect("policy lock poisoned");
        inner.blocked_packages.insert(package.to_string());
    }

    pub fn block_channel(&self, package: &str, channel_id: &str) {
        let mut inner = self.inner.write().expect("policy lock poisoned");
        if let Some(ch) = inner.channels.get_mut(&format!("{}:{}", package, channel_id)) {
            ch.blocked = true;
        }
    }

    pub fn set_zen(&self, zen: ZenMode) {
        let mut inner = self.inner.write().expect("policy lock poisoned");
        inner.zen = zen;
    }

    pub fn set_channel_importance(&self, package: &str, channel_id: &str, importance: Importance) {
        let mut inner = self.inner.write().expect("policy lock poisoned");
        inner
            .channel_importance
            .insert(format!("{}:{}", package, channel_id), importance);
    }

    fn has_channels_for(&self, package: &str) -> bool {
        let inner = self.inner.read().expect("policy lock poisoned");
        let prefix = format!("{}:", package);
        inner.channels.keys().any(|k| k.starts_with(&prefix))
    }
}

impl PolicyProvider for StaticPolicy {
    fn is_blocked(&self, package: &str, channel_id: &str) -> bool {
        let inner = self.inner.read().expect("policy lock poisoned");
        if inner.blocked_packages.contains(package) {
            return true;
        }
        inner
            .channels
            .get(&format!("{}:{}", package, channel_id))
            .map(|ch| ch.blocked)
            .unwrap_or(false)
    }

    fn snapshot(&self) -> PolicySnapshot {
        let inner = self.inner.read().expect("policy lock poisoned");
        PolicySnapshot {
            zen: inner.zen,
            channel_importance: inner.channel_importance.clone(),
        }
    }

    fn resolve_channel(&self, package: &str, _user_id: i32, channel_id: &str) -> Option<ChannelInfo> {
        let key = format!("{}:{}", package, channel_id);
        {
            let inner = self.inner.read().expect("policy lock poisoned");
            if let Some(ch) = inner.channels.get(&key) {
                return Some(ch.clone());
            }
        }
        if self.has_channels_for(package) {
            // Package declared channels but referenced a missing one.
            None
        } else {
            Some(ChannelInfo::new(channel_id, Importance::Default))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Payload, RecordKey};

    fn record(importance: Importance) -> NotificationRecord {
        NotificationRecord::new(
            RecordKey::new("pkg", 0, None, 1),
            10001,
            "default",
            Payload::new("t", "b"),
        )
        .with_importance(importance)
    }

    #[test]
    fn test_zen_off_intercepts_nothing() {
        let policy = StaticPolicy::new();
        let snap = policy.snapshot();
        assert!(!policy.should_intercept(&record(Importance::Min), &snap));
    }

    #[test]
    fn test_priority_only_intercepts_below_high() {
        let policy = StaticPolicy::new();
        policy.set_zen(ZenMode::PriorityOnly);
        let snap = policy.snapshot();
        assert!(policy.should_intercept(&record(Importance::Default), &snap));
        assert!(!policy.should_intercept(&record(Importance::High), &snap));
    }

    #[test]
    fn test_total_zen_spares_critical_records() {
        let policy = StaticPolicy::new();
        policy.set_zen(ZenMode::Total);
        let snap = policy.snapshot();

        assert!(policy.should_intercept(&record(Importance::High), &snap));

        let mut critical = record(Importance::High);
        critical.criticality = -1;
        assert!(!policy.should_intercept(&critical, &snap));
    }

    #[test]
    fn test_resolve_channel_defaults_when_no_channels_declared() {
        let policy = StaticPolicy::new();
        let ch = policy.resolve_channel("pkg", 0, "whatever").unwrap();
        assert_eq!(ch.importance, Importance::Default);
    }

    #[test]
    fn test_resolve_channel_rejects_missing_declared() {
        let policy = StaticPolicy::new();
        policy.add_channel("pkg", ChannelInfo::new("alerts", Importance::High));

        assert!(policy.resolve_channel("pkg", 0, "alerts").is_some());
        assert!(policy.resolve_channel("pkg", 0, "missing").is_none());
    }

    #[test]
    fn test_blocked_package_and_channel() {
        let policy = StaticPolicy::new();
        policy.add_channel("pkg", ChannelInfo::new("alerts", Importance::High));

        assert!(!policy.is_blocked("pkg", "alerts"));
        policy.block_channel("pkg", "alerts");
        assert!(policy.is_blocked("pkg", "alerts"));

        policy.block_package("other");
        assert!(policy.is_blocked("other", "anything"));
    }
}
