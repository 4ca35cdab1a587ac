//! 通知记录 - 管线的核心实体
//!
//! 一条通知在系统内的全部可变状态。记录在 {enqueued, posted, snoozed}
//! 三个集合中任意时刻只属于一个，由管线独占持有。

pub mod adjustment;
pub mod flags;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use adjustment::Adjustment;
pub use flags::Flags;

/// 重要性等级（升序排列，用于排序比较）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    None,
    Min,
    Low,
    #[default]
    Default,
    High,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::None => "NONE",
            Importance::Min => "MIN",
            Importance::Low => "LOW",
            Importance::Default => "DEFAULT",
            Importance::High => "HIGH",
        }
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 可见性（数值越小越保密，合并时取最严格者）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Secret,
    Private,
    #[default]
    Public,
}

/// 通知内容快照
///
/// 核心引擎不解释内容，只读取分组相关字段和打扰性对比字段
/// （title/text/icon，见 `interruptive_fields`）。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Payload {
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

impl Payload {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    /// 打扰性对比的固定字段集（归一化后比较）
    fn interruptive_fields(&self) -> (String, String, Option<&str>) {
        (
            self.title.trim().to_string(),
            self.text.trim().to_string(),
            self.icon.as_deref(),
        )
    }

    /// 内容是否发生了"视觉可打扰"的变化
    pub fn interruptive_diff(&self, other: &Payload) -> bool {
        self.interruptive_fields() != other.interruptive_fields()
    }
}

/// 记录标识 - 由 (package, user, tag, id) 派生，创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub package: String,
    pub user_id: i32,
    pub tag: Option<String>,
    pub id: i32,
}

impl RecordKey {
    pub fn new(package: impl Into<String>, user_id: i32, tag: Option<String>, id: i32) -> Self {
        Self {
            package: package.into(),
            user_id,
            tag,
            id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.user_id,
            self.package,
            self.tag.as_deref().unwrap_or(""),
            self.id
        )
    }
}

/// 通知记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// 记录标识
    pub key: RecordKey,
    /// 发布方 uid
    pub uid: u32,
    /// 通道 ID
    pub channel_id: String,
    /// 内容快照
    pub payload: Payload,
    /// 标志位
    pub flags: Flags,
    /// 应用声明的组键
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    /// 系统覆盖的组键（自动分组）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_group_key: Option<String>,
    /// 有效重要性（每轮排名时从 `requested_importance` 与策略快照重算）
    pub importance: Importance,
    /// 应用请求的重要性基准；快照覆盖解除后回退到该值
    #[serde(default)]
    pub requested_importance: Importance,
    /// 助手调整的排名分数（正数提升，负数降低，0 保持稳定序）
    #[serde(default)]
    pub rank_score: f32,
    /// 是否被策略拦截（DND 等，派生字段）
    #[serde(default)]
    pub is_intercepted: bool,
    /// 计算出的排序键（排序过程写回，不长期保存）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<String>,
    /// 紧要程度（越小越紧要）
    #[serde(default)]
    pub criticality: i32,
    /// 首次发布时间
    pub post_time: DateTime<Utc>,
    /// 最近更新时间
    pub update_time: DateTime<Utc>,
    /// 排名时间（视觉可打扰的更新会重置）
    pub ranking_time: DateTime<Utc>,
    /// 最近一次有声提醒时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_audibly_alerted: Option<DateTime<Utc>>,
    /// 待合并的助手调整
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<Adjustment>,
    /// 本次发布是否静默（不触发提醒）
    #[serde(default)]
    pub post_silently: bool,
    /// 最大存活时长（到期自动移除）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl NotificationRecord {
    /// 创建新记录
    pub fn new(key: RecordKey, uid: u32, channel_id: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            key,
            uid,
            channel_id: channel_id.into(),
            payload,
            flags: Flags::NONE,
            group_key: None,
            override_group_key: None,
            importance: Importance::Default,
            requested_importance: Importance::Default,
            rank_score: 0.0,
            is_intercepted: false,
            sort_key: None,
            criticality: 0,
            post_time: now,
            update_time: now,
            ranking_time: now,
            last_audibly_alerted: None,
            adjustments: Vec::new(),
            post_silently: false,
            ttl: None,
        }
    }

    /// 设置标志（链式调用）
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// 设置应用组键（链式调用）
    pub fn with_group_key(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    /// 设置重要性（链式调用）
    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self.requested_importance = importance;
        self
    }

    /// 有效组键：系统覆盖优先于应用声明
    pub fn effective_group_key(&self) -> Option<&str> {
        self.override_group_key
            .as_deref()
            .or(self.group_key.as_deref())
    }

    pub fn is_summary(&self) -> bool {
        self.flags.contains(Flags::GROUP_SUMMARY)
    }

    pub fn is_child(&self) -> bool {
        self.flags.contains(Flags::GROUP_CHILD)
    }

    pub fn is_autogroup_summary(&self) -> bool {
        self.flags.contains(Flags::AUTOGROUP_SUMMARY)
    }

    /// 稀疏记录：没有任何分组关联的单独通知（自动分组候选）
    pub fn is_sparse(&self) -> bool {
        self.effective_group_key().is_none() && !self.is_summary() && !self.is_child()
    }

    /// 同一 key 的更新：继承旧记录的发布时间与提醒历史，
    /// 仅当打扰性内容变化时重置排名时间。
    pub fn inherit_from(&mut self, prev: &NotificationRecord) {
        self.post_time = prev.post_time;
        self.last_audibly_alerted = prev.last_audibly_alerted;
        if !self.payload.interruptive_diff(&prev.payload) {
            self.ranking_time = prev.ranking_time;
        }
    }

    /// 合并待处理的助手调整（排名前调用）
    pub fn apply_adjustments(&mut self) {
        let pending = std::mem::take(&mut self.adjustments);
        for adj in pending {
            match adj.signal.as_str() {
                adjustment::KEY_RANKING_SCORE => {
                    if let Some(v) = adj.value.as_f64() {
                        self.rank_score = v as f32;
                    }
                }
                adjustment::KEY_IMPORTANCE => {
                    if let Ok(imp) = serde_json::from_value::<Importance>(adj.value) {
                        self.importance = imp;
                        // 助手替换的是请求基准，后续排名以此为准
                        self.requested_importance = imp;
                    }
                }
                adjustment::KEY_GROUP_KEY => {
                    if let Some(v) = adj.value.as_str() {
                        self.override_group_key = Some(v.to_string());
                    }
                }
                adjustment::KEY_CRITICALITY => {
                    if let Some(v) = adj.value.as_i64() {
                        self.criticality = v as i32;
                    }
                }
                other => {
                    tracing::debug!(signal = %other, key = %self.key, "Ignoring unknown adjustment signal");
                }
            }
        }
    }
}
