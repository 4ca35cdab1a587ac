//! Notification Hub - 通知管理引擎（入队、策略、排名、分组、投递）

pub mod config;
pub mod error;
pub mod grouping;
pub mod history;
pub mod observer;
pub mod pipeline;
pub mod policy;
pub mod ranking;
pub mod rate_limit;
pub mod record;
pub mod snooze;
pub mod tracker;

pub use config::HubConfig;
pub use error::{CancelOutcome, DropReason, EnqueueOutcome, HubError};
pub use grouping::{GroupPlan, GroupingEngine, SummaryAttrs, AUTOGROUP_TAG};
pub use history::{HistoryRow, HistoryStore};
pub use observer::{
    EventKind, HubEvent, HubObserver, ObserverFilter, ObserverRegistry, ObserverToken,
    RankingEntry, RankingSnapshot, RemoveReason, Trim,
};
pub use pipeline::{Assistant, HubStats, NotificationPipeline};
pub use policy::{ChannelInfo, PolicyProvider, PolicySnapshot, StaticPolicy, ZenMode};
pub use ranking::RankingEngine;
pub use record::{
    Adjustment, Flags, Importance, NotificationRecord, Payload, RecordKey, Visibility,
};
pub use snooze::{SnoozeEntry, SnoozeStore, WakeCondition};
pub use tracker::{PermitTracker, PostPermit};
