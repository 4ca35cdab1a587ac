//! 分组引擎 - 组摘要生命周期与稀疏通知自动分组
//!
//! 引擎本身不持有任何集合：它在管线的临界区内对传入的在线集合做纯计算，
//! 产出 `GroupPlan`，由管线原子地应用（重复摘要检测也必须发生在同一临界
//! 区内）。
//!
//! ## 策略
//! - 同一 (package, user) 下稀疏单独通知达到 K 条（默认 3）时，
//!   全部并入一个合成组，并创建应用不可见的合成摘要
//! - 组内剩余子通知少于 2 条时降级（移除合成摘要 / 剥离摘要标志）
//! - 摘要被外部直接取消时，宽限期后清理孤儿子通知
//! - 强制分组模式（宿主可选）：所有未分组通知在宽限期后并入合成组

use tracing::debug;

use crate::record::{Flags, NotificationRecord, Payload, RecordKey, Visibility};

/// 合成摘要使用的保留 tag
pub const AUTOGROUP_TAG: &str = "nhub.autogroup";

/// 合成组键
pub fn synthetic_group_key(package: &str, user_id: i32) -> String {
    format!("autogroup|{}|{}", user_id, package)
}

/// 合成摘要的记录标识（每个 package+user 恒定，天然去重）
pub fn summary_key(package: &str, user_id: i32) -> RecordKey {
    RecordKey::new(package, user_id, Some(AUTOGROUP_TAG.to_string()), 0)
}

/// 摘要聚合属性 - 从子通知按固定合并策略计算
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryAttrs {
    /// 仅当所有子通知一致时才显示图标
    pub icon: Option<String>,
    /// 仅当所有子通知一致时才使用颜色
    pub color: Option<u32>,
    /// 最严格的可见性
    pub visibility: Visibility,
    /// 子通知 ONGOING / NO_CLEAR 的按位或
    pub flags: Flags,
}

/// 分组决策 - 由管线在同一临界区内应用
#[derive(Debug, Clone)]
pub enum GroupPlan {
    /// 将 `members` 并入合成组并创建/更新合成摘要
    Promote {
        group_key: String,
        members: Vec<RecordKey>,
        attrs: SummaryAttrs,
    },
    /// 组低于 2 条子通知：移除合成摘要并剥离成员的合成组键，
    /// 或（应用组）剥离摘要标志
    Demote {
        group_key: String,
        synthetic: bool,
        summary_key: Option<RecordKey>,
        members: Vec<RecordKey>,
    },
}

/// 分组引擎
pub struct GroupingEngine {
    /// 稀疏组阈值 K
    sparse_threshold: usize,
}

impl GroupingEngine {
    pub fn new(sparse_threshold: usize) -> Self {
        Self {
            sparse_threshold: sparse_threshold.max(1),
        }
    }

    /// 发布后检查：是否需要自动分组
    ///
    /// `live` 是 posted 集合的当前视图（含刚发布的记录）。
    /// 达到阈值时返回 Promote 计划，成员为该 package+user 的全部稀疏记录。
    pub fn on_posted(&self, record: &NotificationRecord, live: &[&NotificationRecord]) -> Option<GroupPlan> {
        if !record.is_sparse() {
            return None;
        }

        // 该 package+user 已有合成组：新的稀疏记录直接并入，无须再过阈值
        let group_key = synthetic_group_key(&record.key.package, record.key.user_id);
        let has_synthetic_summary = live.iter().any(|r| {
            r.key.package == record.key.package
                && r.key.user_id == record.key.user_id
                && r.is_autogroup_summary()
        });
        if has_synthetic_summary {
            let mut children: Vec<&NotificationRecord> = live
                .iter()
                .filter(|r| {
                    r.key.package == record.key.package
                        && r.key.user_id == record.key.user_id
                        && r.effective_group_key() == Some(group_key.as_str())
                        && !r.is_summary()
                })
                .copied()
                .collect();
            if !children.iter().any(|r| r.key == record.key) {
                children.push(record);
            }
            return Some(GroupPlan::Promote {
                group_key,
                members: vec![record.key.clone()],
                attrs: merge_summary_attrs(&children),
            });
        }

        let sparse: Vec<&NotificationRecord> = live
            .iter()
            .filter(|r| {
                r.key.package == record.key.package
                    && r.key.user_id == record.key.user_id
                    && r.is_sparse()
            })
            .copied()
            .collect();

        if sparse.len() < self.sparse_threshold {
            debug!(
                package = %record.key.package,
                sparse = sparse.len(),
                threshold = self.sparse_threshold,
                "Below sparse threshold, no autogroup"
            );
            return None;
        }

        Some(GroupPlan::Promote {
            group_key,
            members: sparse.iter().map(|r| r.key.clone()).collect(),
            attrs: merge_summary_attrs(&sparse),
        })
    }

    /// 强制分组模式：宽限期后仍未分组的记录直接并入合成组（无视阈值）
    pub fn force_group(&self, record: &NotificationRecord, live: &[&NotificationRecord]) -> Option<GroupPlan> {
        if !record.is_sparse() || record.is_autogroup_summary() {
            return None;
        }
        let mut members: Vec<&NotificationRecord> = live
            .iter()
            .filter(|r| {
                r.key.package == record.key.package
                    && r.key.user_id == record.key.user_id
                    && r.is_sparse()
            })
            .copied()
            .collect();
        if !members.iter().any(|r| r.key == record.key) {
            members.push(record);
        }

        Some(GroupPlan::Promote {
            group_key: synthetic_group_key(&record.key.package, record.key.user_id),
            members: members.iter().map(|r| r.key.clone()).collect(),
            attrs: merge_summary_attrs(&members),
        })
    }

    /// 移除后检查：组是否需要降级
    ///
    /// `live` 是移除后的 posted 集合视图。组内剩余子通知少于 2 条时，
    /// 合成组移除摘要并剥离组键；应用组剥离摘要标志。
    pub fn on_removed(&self, removed: &NotificationRecord, live: &[&NotificationRecord]) -> Option<GroupPlan> {
        let group_key = removed.effective_group_key()?.to_string();

        let children: Vec<&NotificationRecord> = live
            .iter()
            .filter(|r| {
                r.key.package == removed.key.package
                    && r.key.user_id == removed.key.user_id
                    && r.effective_group_key() == Some(group_key.as_str())
                    && !r.is_summary()
            })
            .copied()
            .collect();

        if children.len() >= 2 {
            return None;
        }

        let summary = live.iter().find(|r| {
            r.key.package == removed.key.package
                && r.key.user_id == removed.key.user_id
                && r.effective_group_key() == Some(group_key.as_str())
                && r.is_summary()
        });

        match summary {
            Some(s) => Some(GroupPlan::Demote {
                group_key,
                synthetic: s.is_autogroup_summary(),
                summary_key: Some(s.key.clone()),
                members: children.iter().map(|r| r.key.clone()).collect(),
            }),
            // 摘要已不在线（可能正是被移除的记录）：只剥离残余成员
            None if !children.is_empty() => Some(GroupPlan::Demote {
                group_key,
                synthetic: removed.is_autogroup_summary(),
                summary_key: None,
                members: children.iter().map(|r| r.key.clone()).collect(),
            }),
            None => None,
        }
    }

    /// 摘要被外部取消后的孤儿子通知（宽限期到期时由管线查询）
    pub fn orphaned_children(
        &self,
        package: &str,
        user_id: i32,
        group_key: &str,
        live: &[&NotificationRecord],
    ) -> Vec<RecordKey> {
        live.iter()
            .filter(|r| {
                r.key.package == package
                    && r.key.user_id == user_id
                    && r.effective_group_key() == Some(group_key)
                    && !r.is_summary()
            })
            .map(|r| r.key.clone())
            .collect()
    }

    /// 构造合成摘要记录（应用不可见，带 AUTOGROUP_SUMMARY 标志）
    pub fn make_summary(
        &self,
        package: &str,
        user_id: i32,
        uid: u32,
        channel_id: &str,
        group_key: &str,
        attrs: &SummaryAttrs,
    ) -> NotificationRecord {
        let payload = Payload {
            title: String::new(),
            text: String::new(),
            icon: attrs.icon.clone(),
            color: attrs.color,
            visibility: attrs.visibility,
            actions: Vec::new(),
        };
        let mut summary = NotificationRecord::new(
            summary_key(package, user_id),
            uid,
            channel_id,
            payload,
        );
        summary.flags = attrs.flags | Flags::GROUP_SUMMARY | Flags::AUTOGROUP_SUMMARY;
        summary.group_key = Some(group_key.to_string());
        summary.post_silently = true;
        summary
    }
}

/// 固定的属性合并策略：
/// 图标/颜色全体一致才保留；可见性取最严格；ONGOING/NO_CLEAR 按位或。
pub fn merge_summary_attrs(children: &[&NotificationRecord]) -> SummaryAttrs {
    let mut icons = children.iter().map(|r| r.payload.icon.as_deref());
    let first_icon = icons.next().flatten();
    let icon = if first_icon.is_some() && icons.all(|i| i == first_icon) {
        first_icon.map(|s| s.to_string())
    } else {
        None
    };

    let mut colors = children.iter().map(|r| r.payload.color);
    let first_color = colors.next().flatten();
    let color = if first_color.is_some() && colors.all(|c| c == first_color) {
        first_color
    } else {
        None
    };

    let visibility = children
        .iter()
        .map(|r| r.payload.visibility)
        .min()
        .unwrap_or_default();

    let mut flags = Flags::NONE;
    for r in children {
        if r.flags.contains(Flags::ONGOING) {
            flags.insert(Flags::ONGOING);
        }
        if r.flags.contains(Flags::NO_CLEAR) {
            flags.insert(Flags::NO_CLEAR);
        }
    }

    SummaryAttrs {
        icon,
        color,
        visibility,
        flags,
    }
}
