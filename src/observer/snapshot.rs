//! 排名快照 - 随每个事件下发给观察者的有序排名视图

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::record::{Importance, NotificationRecord};

/// 快照中的一条排名项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingEntry {
    pub key: String,
    pub package: String,
    pub position: usize,
    pub importance: Importance,
    pub is_intercepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

/// 有序排名快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingSnapshot {
    pub entries: Vec<RankingEntry>,
}

impl RankingSnapshot {
    /// 从排好序的记录构建
    pub fn from_ordered(records: &[&NotificationRecord]) -> Self {
        Self {
            entries: records
                .iter()
                .enumerate()
                .map(|(position, r)| RankingEntry {
                    key: r.key.to_string(),
                    package: r.key.package.clone(),
                    position,
                    importance: r.importance,
                    is_intercepted: r.is_intercepted,
                    group_key: r.effective_group_key().map(|s| s.to_string()),
                })
                .collect(),
        }
    }

    pub fn position_of(&self, key: &str) -> Option<usize> {
        self.entries.iter().find(|e| e.key == key).map(|e| e.position)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 裁剪到观察者可见的包集合，位置重新编号
    pub fn scoped_to_packages(&self, allowed: &HashSet<String>) -> RankingSnapshot {
        let mut entries: Vec<RankingEntry> = self
            .entries
            .iter()
            .filter(|e| allowed.contains(&e.package))
            .cloned()
            .collect();
        for (i, e) in entries.iter_mut().enumerate() {
            e.position = i;
        }
        RankingSnapshot { entries }
    }
}
