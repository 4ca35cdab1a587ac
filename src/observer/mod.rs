//! 观察者注册表 - 管理观察者并按过滤条件扇出生命周期事件
//!
//! 每个观察者有独立的投递队列和转发任务：事件在管线的临界区外投递，
//! 慢观察者或失败观察者不会阻塞管线，也不影响其他观察者。
//! 投递语义为 at-least-once；投递回调返回错误的观察者会被注销。

pub mod snapshot;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::record::{NotificationRecord, RecordKey};
pub use snapshot::{RankingEntry, RankingSnapshot};

/// 移除原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveReason {
    /// 应用自行取消
    AppCancel,
    /// 应用取消全部
    AppCancelAll,
    /// 用户手动消除
    UserCancel,
    /// 组摘要被取消后的孤儿清理
    GroupSummaryCanceled,
    /// 延后（移入 snooze 存储）
    Snoozed,
    /// 超过存活时长
    TimedOut,
    /// 通道/应用被屏蔽
    Blocked,
}

impl RemoveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoveReason::AppCancel => "app_cancel",
            RemoveReason::AppCancelAll => "app_cancel_all",
            RemoveReason::UserCancel => "user_cancel",
            RemoveReason::GroupSummaryCanceled => "group_summary_canceled",
            RemoveReason::Snoozed => "snoozed",
            RemoveReason::TimedOut => "timed_out",
            RemoveReason::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 生命周期事件，随排名快照一同下发
#[derive(Debug, Clone)]
pub enum HubEvent {
    Posted {
        record: NotificationRecord,
        ranking: RankingSnapshot,
    },
    Removed {
        key: RecordKey,
        reason: RemoveReason,
        ranking: RankingSnapshot,
    },
    RankingChanged {
        ranking: RankingSnapshot,
    },
    Hidden {
        keys: Vec<RecordKey>,
        ranking: RankingSnapshot,
    },
    Unhidden {
        keys: Vec<RecordKey>,
        ranking: RankingSnapshot,
    },
}

/// 事件种类（过滤用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Posted,
    Removed,
    RankingChanged,
    Hidden,
    Unhidden,
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::Posted { .. } => EventKind::Posted,
            HubEvent::Removed { .. } => EventKind::Removed,
            HubEvent::RankingChanged { .. } => EventKind::RankingChanged,
            HubEvent::Hidden { .. } => EventKind::Hidden,
            HubEvent::Unhidden { .. } => EventKind::Unhidden,
        }
    }

    /// 事件主体的包名（RankingChanged 无单一主体）
    fn subject_package(&self) -> Option<&str> {
        match self {
            HubEvent::Posted { record, .. } => Some(&record.key.package),
            HubEvent::Removed { key, .. } => Some(&key.package),
            _ => None,
        }
    }
}

/// 裁剪级别：Redacted 下发时剥离通知正文
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trim {
    #[default]
    Full,
    Redacted,
}

/// 观察者的可见性过滤
#[derive(Debug, Clone, Default)]
pub struct ObserverFilter {
    /// 允许的包集合；None 表示全部可见
    pub packages: Option<HashSet<String>>,
    /// 关心的事件种类；None 表示全部
    pub kinds: Option<HashSet<EventKind>>,
    /// 裁剪级别
    pub trim: Trim,
}

impl ObserverFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_packages<I: IntoIterator<Item = String>>(mut self, packages: I) -> Self {
        self.packages = Some(packages.into_iter().collect());
        self
    }

    pub fn with_kinds<I: IntoIterator<Item = EventKind>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn redacted(mut self) -> Self {
        self.trim = Trim::Redacted;
        self
    }

    fn wants_kind(&self, kind: EventKind) -> bool {
        self.kinds.as_ref().map_or(true, |k| k.contains(&kind))
    }

    fn sees_package(&self, package: &str) -> bool {
        self.packages.as_ref().map_or(true, |p| p.contains(package))
    }
}

/// 观察者回调接口
pub trait HubObserver: Send + Sync {
    /// 名称（用于日志）
    fn name(&self) -> &str;

    /// 投递一个事件；返回错误会导致观察者被注销
    fn deliver(&self, event: &HubEvent) -> anyhow::Result<()>;
}

/// 观察者会话句柄（注销凭据）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

struct Registered {
    name: String,
    filter: ObserverFilter,
    tx: mpsc::UnboundedSender<HubEvent>,
}

struct RegistryInner {
    next_token: AtomicU64,
    observers: Mutex<HashMap<u64, Registered>>,
}

/// 观察者注册表
#[derive(Clone)]
pub struct ObserverRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_token: AtomicU64::new(1),
                observers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 注册观察者，为其启动独立的转发任务
    pub fn register(&self, observer: Arc<dyn HubObserver>, filter: ObserverFilter) -> ObserverToken {
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<HubEvent>();

        info!(observer = observer.name(), token, "Registering observer");
        {
            let mut observers = self.inner.observers.lock().expect("observer lock poisoned");
            observers.insert(
                token,
                Registered {
                    name: observer.name().to_string(),
                    filter,
                    tx,
                },
            );
        }

        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = observer.deliver(&event) {
                    warn!(observer = observer.name(), error = %e, "Observer delivery failed, unregistering");
                    registry.unregister(ObserverToken(token));
                    break;
                }
            }
        });

        ObserverToken(token)
    }

    pub fn unregister(&self, token: ObserverToken) {
        let mut observers = self.inner.observers.lock().expect("observer lock poisoned");
        if let Some(removed) = observers.remove(&token.0) {
            info!(observer = %removed.name, token = token.0, "Observer unregistered");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .expect("observer lock poisoned")
            .len()
    }

    /// 向所有符合过滤条件的观察者扇出事件（fire-and-forget）
    pub fn publish(&self, event: &HubEvent) {
        let observers = self.inner.observers.lock().expect("observer lock poisoned");
        for (token, reg) in observers.iter() {
            if !reg.filter.wants_kind(event.kind()) {
                continue;
            }
            if let Some(pkg) = event.subject_package() {
                if !reg.filter.sees_package(pkg) {
                    continue;
                }
            }
            let scoped = scope_event(event, &reg.filter);
            if reg.tx.send(scoped).is_err() {
                debug!(token, "Observer queue closed");
            }
        }
    }
}

/// 按观察者过滤裁剪事件内容
fn scope_event(event: &HubEvent, filter: &ObserverFilter) -> HubEvent {
    let mut scoped = event.clone();

    // 排名快照裁剪到可见包
    if let Some(allowed) = &filter.packages {
        match &mut scoped {
            HubEvent::Posted { ranking, .. }
            | HubEvent::Removed { ranking, .. }
            | HubEvent::RankingChanged { ranking }
            | HubEvent::Hidden { ranking, .. }
            | HubEvent::Unhidden { ranking, .. } => {
                *ranking = ranking.scoped_to_packages(allowed);
            }
        }
        if let HubEvent::Hidden { keys, .. } | HubEvent::Unhidden { keys, .. } = &mut scoped {
            keys.retain(|k| allowed.contains(&k.package));
        }
    }

    // Redacted：剥离正文内容
    if filter.trim == Trim::Redacted {
        if let HubEvent::Posted { record, .. } = &mut scoped {
            record.payload.title.clear();
            record.payload.text.clear();
            record.payload.actions.clear();
        }
    }

    scoped
}
