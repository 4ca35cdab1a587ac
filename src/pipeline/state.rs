//! 管线权威状态 - 单一串行化域保护的全部集合
//!
//! enqueued / posted / snoozed 三个集合、派生的 groupKey→摘要索引、
//! 限流器与计数器都在同一把互斥锁之下：排名位置和组成员关系是跨多条
//! 记录的读-改-写，必须整体原子。

use std::collections::HashMap;

use crate::rate_limit::RateLimiter;
use crate::record::{NotificationRecord, RecordKey};
use crate::snooze::SnoozeStore;
use crate::tracker::PostPermit;

/// 诊断计数器（单调递增）
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub enqueued: u64,
    pub posted: u64,
    pub removed: u64,
    pub dropped_rate_limited: u64,
    pub dropped_over_quota: u64,
    pub dropped_blocked: u64,
    pub dropped_no_channel: u64,
    /// 同一组键检测到重复摘要的次数（合并处理，不崩溃）
    pub cascade_conflicts: u64,
}

/// 摘要索引键：(package, user, group_key)
pub type SummaryIndexKey = (String, i32, String);

/// 管线状态
pub struct PipelineState {
    /// 已入队、尚未发布
    pub enqueued: HashMap<RecordKey, NotificationRecord>,
    /// 已发布
    pub posted: HashMap<RecordKey, NotificationRecord>,
    /// posted 的当前排名顺序
    pub order: Vec<RecordKey>,
    /// 派生索引：groupKey → 摘要记录（派生数据，成员变化时重建）
    pub summary_index: HashMap<SummaryIndexKey, RecordKey>,
    /// 每 key 的代次计数，用于作废被取代的延迟任务
    pub epochs: HashMap<RecordKey, u64>,
    /// 在途发布的许可（acquire-on-submit, release-on-terminal）
    pub permits: HashMap<RecordKey, PostPermit>,
    /// 延后存储
    pub snooze: SnoozeStore,
    /// 入队限流器
    pub rate: RateLimiter,
    /// 诊断计数器
    pub counters: Counters,
}

impl PipelineState {
    pub fn new(snooze: SnoozeStore, rate: RateLimiter) -> Self {
        Self {
            enqueued: HashMap::new(),
            posted: HashMap::new(),
            order: Vec::new(),
            summary_index: HashMap::new(),
            epochs: HashMap::new(),
            permits: HashMap::new(),
            snooze,
            rate,
            counters: Counters::default(),
        }
    }

    /// 为 key 开启新代次，作废所有在途的延迟任务
    pub fn bump_epoch(&mut self, key: &RecordKey) -> u64 {
        let e = self.epochs.entry(key.clone()).or_insert(0);
        *e += 1;
        *e
    }

    pub fn current_epoch(&self, key: &RecordKey) -> Option<u64> {
        self.epochs.get(key).copied()
    }

    /// 某 (package, user) 的非豁免在线数量（配额检查）
    pub fn live_count(&self, package: &str, user_id: i32) -> usize {
        let count = |r: &NotificationRecord| {
            r.key.package == package
                && r.key.user_id == user_id
                && !r.flags.contains(crate::record::Flags::FOREGROUND_SERVICE)
                && !r.is_autogroup_summary()
        };
        self.enqueued.values().filter(|r| count(r)).count()
            + self.posted.values().filter(|r| count(r)).count()
    }

    /// posted 记录按当前排名顺序的引用
    pub fn ordered_posted(&self) -> Vec<&NotificationRecord> {
        self.order
            .iter()
            .filter_map(|k| self.posted.get(k))
            .collect()
    }

    /// 重建摘要索引（派生数据，不权威）
    pub fn rebuild_summary_index(&mut self) {
        self.summary_index.clear();
        for (key, record) in &self.posted {
            if !record.is_summary() {
                continue;
            }
            if let Some(gk) = record.effective_group_key() {
                self.summary_index.insert(
                    (key.package.clone(), key.user_id, gk.to_string()),
                    key.clone(),
                );
            }
        }
    }

    /// 查索引取摘要
    pub fn summary_for(&self, package: &str, user_id: i32, group_key: &str) -> Option<&NotificationRecord> {
        self.summary_index
            .get(&(package.to_string(), user_id, group_key.to_string()))
            .and_then(|k| self.posted.get(k))
    }

    /// 某组当前的子通知 key（同 package/user，非摘要）
    pub fn group_children(&self, package: &str, user_id: i32, group_key: &str) -> Vec<RecordKey> {
        self.posted
            .values()
            .filter(|r| {
                r.key.package == package
                    && r.key.user_id == user_id
                    && r.effective_group_key() == Some(group_key)
                    && !r.is_summary()
            })
            .map(|r| r.key.clone())
            .collect()
    }
}
