//! 延后（snooze）存储 - 暂缓通知及其唤醒条件
//!
//! 记录被延后时从 posted/enqueued 集合移入此存储（移动而非销毁），
//! 以 (user, package, key) 为键，带绝对唤醒时间或外部条件 id。
//! 唤醒计时由管线调度；本模块只定义内存契约。
//!
//! 容量有界：摘要连同子通知作为一个批次，要么全部放入要么全部拒绝，
//! 避免组被部分延后。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::record::{NotificationRecord, RecordKey};

/// 唤醒条件：绝对时间或外部解析的条件 id（如到达某地点）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeCondition {
    At(DateTime<Utc>),
    Criterion(String),
}

/// 一条延后记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoozeEntry {
    pub record: NotificationRecord,
    pub wake: WakeCondition,
    /// 条件式唤醒时是否静默重发（"mute on return"）
    #[serde(default)]
    pub mute_on_return: bool,
}

/// 持久化协作方消费的逻辑行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnoozeRow {
    pub user_id: i32,
    pub package: String,
    pub key: String,
    pub wake: WakeCondition,
}

/// 延后存储
pub struct SnoozeStore {
    entries: HashMap<RecordKey, SnoozeEntry>,
    /// 每用户容量上限
    capacity_per_user: usize,
}

impl SnoozeStore {
    pub fn new(capacity_per_user: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity_per_user,
        }
    }

    /// 检查某用户还能否再放入 n 条
    pub fn can_snooze(&self, user_id: i32, n: usize) -> bool {
        let current = self
            .entries
            .keys()
            .filter(|k| k.user_id == user_id)
            .count();
        current + n <= self.capacity_per_user
    }

    /// 放入一个批次（全部成功或全部拒绝）
    ///
    /// 摘要 + 子通知必须作为一个批次传入，防止部分延后。
    pub fn snooze_batch(&mut self, batch: Vec<(NotificationRecord, WakeCondition, bool)>) -> bool {
        if batch.is_empty() {
            return true;
        }
        let user_id = batch[0].0.key.user_id;
        if !self.can_snooze(user_id, batch.len()) {
            debug!(user_id, n = batch.len(), "Snooze batch rejected: capacity");
            return false;
        }
        for (record, wake, mute_on_return) in batch {
            self.entries.insert(
                record.key.clone(),
                SnoozeEntry {
                    record,
                    wake,
                    mute_on_return,
                },
            );
        }
        true
    }

    /// 放入单条记录
    pub fn snooze(&mut self, record: NotificationRecord, wake: WakeCondition) -> bool {
        self.snooze_batch(vec![(record, wake, false)])
    }

    pub fn is_snoozed(&self, key: &RecordKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 取出指定记录（重发路径）
    pub fn take(&mut self, key: &RecordKey) -> Option<SnoozeEntry> {
        self.entries.remove(key)
    }

    /// 取出指定用户的全部记录（解除全部延后）
    pub fn take_for_users(&mut self, user_ids: &[i32]) -> Vec<SnoozeEntry> {
        let keys: Vec<RecordKey> = self
            .entries
            .keys()
            .filter(|k| user_ids.contains(&k.user_id))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    /// 取出等待某条件的全部记录（条件达成时由外部调用）
    pub fn take_for_criterion(&mut self, criterion: &str) -> Vec<SnoozeEntry> {
        let keys: Vec<RecordKey> = self
            .entries
            .iter()
            .filter(
                |(_, e)| matches!(&e.wake, WakeCondition::Criterion(c) if c == criterion),
            )
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    /// 取出某组的摘要与子通知（重发组摘要路径）
    pub fn take_group(&mut self, package: &str, user_id: i32, group_key: &str) -> Vec<SnoozeEntry> {
        let keys: Vec<RecordKey> = self
            .entries
            .iter()
            .filter(|(k, e)| {
                k.package == package
                    && k.user_id == user_id
                    && e.record.effective_group_key() == Some(group_key)
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    /// 直接取消（不重发）：按 user/package 过滤，tag/id 可选收窄
    pub fn cancel(
        &mut self,
        user_id: i32,
        package: &str,
        tag: Option<&str>,
        id: Option<i32>,
    ) -> usize {
        let keys: Vec<RecordKey> = self
            .entries
            .keys()
            .filter(|k| {
                k.user_id == user_id
                    && k.package == package
                    && tag.map_or(true, |t| k.tag.as_deref() == Some(t))
                    && id.map_or(true, |i| k.id == i)
            })
            .cloned()
            .collect();
        for k in &keys {
            self.entries.remove(k);
        }
        keys.len()
    }

    /// 导出给持久化协作方的逻辑行
    pub fn serialize_rows(&self) -> Vec<SnoozeRow> {
        self.entries
            .iter()
            .map(|(k, e)| SnoozeRow {
                user_id: k.user_id,
                package: k.package.clone(),
                key: k.to_string(),
                wake: e.wake.clone(),
            })
            .collect()
    }

    /// 导出完整条目（重启前）
    pub fn export_entries(&self) -> Vec<SnoozeEntry> {
        self.entries.values().cloned().collect()
    }

    /// 导入条目（重启后恢复）
    pub fn load_entries(&mut self, entries: Vec<SnoozeEntry>) {
        for e in entries {
            self.entries.insert(e.record.key.clone(), e);
        }
    }
}
