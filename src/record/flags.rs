//! 通知标志位 - 生命周期/分组/策略标志的位集合
//!
//! 取消路径使用 must_have / must_not_have 掩码语义，
//! 因此保留位运算形式，但按关注点划分常量分组。

use serde::{Deserialize, Serialize};

/// 通知标志位集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(pub u32);

impl Flags {
    /// 空标志
    pub const NONE: Flags = Flags(0);

    // ---- 生命周期标志 ----
    /// 持续通知（不可滑动消除）
    pub const ONGOING: Flags = Flags(1 << 0);
    /// 不可被"清除全部"移除
    pub const NO_CLEAR: Flags = Flags(1 << 1);
    /// 前台服务关联（仅系统可设置）
    pub const FOREGROUND_SERVICE: Flags = Flags(1 << 2);
    /// 点击后自动取消
    pub const AUTO_CANCEL: Flags = Flags(1 << 3);

    // ---- 分组标志 ----
    /// 应用提供的组摘要
    pub const GROUP_SUMMARY: Flags = Flags(1 << 4);
    /// 组内子通知
    pub const GROUP_CHILD: Flags = Flags(1 << 5);
    /// 系统合成的自动分组摘要（应用不可见）
    pub const AUTOGROUP_SUMMARY: Flags = Flags(1 << 6);

    // ---- 策略标志 ----
    /// 气泡通知
    pub const BUBBLE: Flags = Flags(1 << 7);
    /// 生命周期延长（直接回复后暂缓删除，仅系统可设置）
    pub const LIFETIME_EXTENDED: Flags = Flags(1 << 8);
    /// 提升显示（仅系统可设置）
    pub const PROMOTED: Flags = Flags(1 << 9);

    /// 调用方不允许自行设置的标志（入队时剥离）
    pub const CALLER_IMMUTABLE: Flags = Flags(
        Self::FOREGROUND_SERVICE.0
            | Self::LIFETIME_EXTENDED.0
            | Self::PROMOTED.0
            | Self::AUTOGROUP_SUMMARY.0,
    );

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// 掩码检查：`(flags & must_have) == must_have && (flags & must_not_have) == 0`
    ///
    /// 这是保护前台服务/生命周期延长通知不被随意取消的机制。
    pub fn matches(&self, must_have: Flags, must_not_have: Flags) -> bool {
        self.contains(must_have) && !self.intersects(must_not_have)
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}
