//! 管线集成测试：入队/发布/取消/延后/策略传播的端到端行为

use std::sync::{Arc, Mutex};
use std::time::Duration;

use notification_hub::{
    Adjustment, Assistant, CancelOutcome, ChannelInfo, DropReason, EnqueueOutcome, EventKind,
    Flags, HubConfig, HubEvent, HubObserver, Importance, NotificationPipeline, NotificationRecord,
    ObserverFilter, Payload, RecordKey, RemoveReason, StaticPolicy, WakeCondition, ZenMode,
};

/// 录制观察者：收集全部事件供断言
struct RecordingObserver {
    events: Mutex<Vec<HubEvent>>,
}

impl RecordingObserver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    fn events(&self) -> Vec<HubEvent> {
        self.events.lock().unwrap().clone()
    }

    fn posted_keys(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                HubEvent::Posted { record, .. } => Some(record.key.to_string()),
                _ => None,
            })
            .collect()
    }

    fn removed(&self) -> Vec<(String, RemoveReason)> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                HubEvent::Removed { key, reason, .. } => Some((key.to_string(), *reason)),
                _ => None,
            })
            .collect()
    }

    fn count_of(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }
}

impl HubObserver for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    fn deliver(&self, event: &HubEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn record(pkg: &str, id: i32) -> NotificationRecord {
    NotificationRecord::new(
        RecordKey::new(pkg, 0, None, id),
        10001,
        "default",
        Payload::new(format!("title-{}", id), "text"),
    )
}

fn key(pkg: &str, id: i32) -> RecordKey {
    RecordKey::new(pkg, 0, None, id)
}

fn setup(config: HubConfig) -> (NotificationPipeline, Arc<StaticPolicy>, Arc<RecordingObserver>) {
    let policy = Arc::new(StaticPolicy::new());
    let pipeline = NotificationPipeline::new(config, policy.clone());
    let observer = RecordingObserver::new();
    pipeline.register_observer(observer.clone(), ObserverFilter::all());
    (pipeline, policy, observer)
}

/// 排空工作者队列，并给观察者转发任务一个调度机会
async fn drain(pipeline: &NotificationPipeline) {
    pipeline.settle().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_enqueue_posts_and_notifies() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    let outcome = pipeline.enqueue(record("pkg", 1)).unwrap();
    assert_eq!(outcome, EnqueueOutcome::Enqueued);
    drain(&pipeline).await;

    let stats = pipeline.stats();
    assert_eq!(stats.counters.posted, 1);
    assert_eq!(stats.live_posted, 1);
    assert_eq!(observer.posted_keys(), vec![key("pkg", 1).to_string()]);
}

#[tokio::test]
async fn test_invalid_arguments_are_synchronous_errors() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());

    let empty_pkg = NotificationRecord::new(
        RecordKey::new("", 0, None, 1),
        10001,
        "default",
        Payload::new("t", "b"),
    );
    assert!(pipeline.enqueue(empty_pkg).is_err());

    let empty_payload = NotificationRecord::new(
        RecordKey::new("pkg", 0, None, 1),
        10001,
        "default",
        Payload::new("", ""),
    );
    assert!(pipeline.enqueue(empty_payload).is_err());

    // 无效请求不触碰任何状态
    assert_eq!(pipeline.stats().counters.enqueued, 0);
}

#[tokio::test]
async fn test_same_key_enqueue_is_update_not_duplicate() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;
    let first_post_time = pipeline.get_record(&key("pkg", 1)).unwrap().post_time;

    let mut update = record("pkg", 1);
    update.payload = Payload::new("updated", "text");
    pipeline.enqueue(update).unwrap();
    drain(&pipeline).await;

    let stats = pipeline.stats();
    assert_eq!(stats.live_posted, 1);
    assert_eq!(stats.counters.posted, 2);
    assert_eq!(observer.count_of(EventKind::Posted), 2);

    let current = pipeline.get_record(&key("pkg", 1)).unwrap();
    assert_eq!(current.payload.title, "updated");
    // 更新继承首次发布时间
    assert_eq!(current.post_time, first_post_time);
}

#[tokio::test]
async fn test_caller_immutable_flags_are_stripped() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());

    pipeline
        .enqueue(record("pkg", 1).with_flags(Flags::ONGOING | Flags::FOREGROUND_SERVICE))
        .unwrap();
    drain(&pipeline).await;

    let posted = pipeline.get_record(&key("pkg", 1)).unwrap();
    assert!(posted.flags.contains(Flags::ONGOING));
    assert!(!posted.flags.contains(Flags::FOREGROUND_SERVICE));
}

#[tokio::test]
async fn test_cancel_removes_and_reports_reason() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;

    let outcome = pipeline.cancel(
        &key("pkg", 1),
        RemoveReason::AppCancel,
        Flags::NONE,
        Flags::NONE,
    );
    assert_eq!(outcome, CancelOutcome::Removed);
    drain(&pipeline).await;

    assert_eq!(pipeline.stats().live_posted, 0);
    assert_eq!(
        observer.removed(),
        vec![(key("pkg", 1).to_string(), RemoveReason::AppCancel)]
    );
}

#[tokio::test]
async fn test_cancel_unknown_key_is_noop() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());
    let outcome = pipeline.cancel(
        &key("pkg", 99),
        RemoveReason::AppCancel,
        Flags::NONE,
        Flags::NONE,
    );
    assert_eq!(outcome, CancelOutcome::NoOp);
}

#[tokio::test]
async fn test_cancel_flag_preconditions_reject() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());

    pipeline
        .enqueue(record("pkg", 1).with_flags(Flags::ONGOING))
        .unwrap();
    drain(&pipeline).await;

    // 用户消除不允许带 ONGOING 的记录
    let outcome = pipeline.cancel(
        &key("pkg", 1),
        RemoveReason::UserCancel,
        Flags::NONE,
        Flags::ONGOING,
    );
    assert_eq!(outcome, CancelOutcome::Rejected);
    assert_eq!(pipeline.stats().live_posted, 1);
}

/// 空操作竞态：发布前取消，外界看不到任何事件
#[tokio::test]
async fn test_cancel_before_post_is_silent() {
    struct Noop;
    impl Assistant for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn on_enqueued(&self, _record: &NotificationRecord) {}
    }

    let config = HubConfig::new().with_assistant_window(Duration::from_millis(300));
    let (pipeline, _policy, observer) = setup(config);
    pipeline.set_assistant(Arc::new(Noop));

    pipeline.enqueue(record("pkg", 1)).unwrap();
    // 发布仍在助手窗口内挂起
    let outcome = pipeline.cancel(
        &key("pkg", 1),
        RemoveReason::AppCancel,
        Flags::NONE,
        Flags::NONE,
    );
    assert_eq!(outcome, CancelOutcome::Removed);

    tokio::time::sleep(Duration::from_millis(400)).await;
    drain(&pipeline).await;

    let stats = pipeline.stats();
    assert_eq!(stats.counters.posted, 0);
    assert!(observer.events().is_empty());
    assert_eq!(stats.permits_outstanding, 0);
}

#[tokio::test]
async fn test_rate_limit_drops_burst() {
    let config = HubConfig::new()
        .with_rate_limit(Duration::from_secs(5), 3)
        .with_sparse_threshold(10);
    let (pipeline, _policy, _observer) = setup(config);

    let mut dropped = 0;
    for i in 0..5 {
        match pipeline.enqueue(record("pkg", i)).unwrap() {
            EnqueueOutcome::Dropped(DropReason::RateLimited) => dropped += 1,
            EnqueueOutcome::Enqueued => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    drain(&pipeline).await;

    assert_eq!(dropped, 2);
    let stats = pipeline.stats();
    assert_eq!(stats.counters.dropped_rate_limited, 2);
    assert_eq!(stats.live_posted, 3);
}

#[tokio::test]
async fn test_quota_caps_live_notifications() {
    let config = HubConfig::new().with_max_live_per_package(2);
    let (pipeline, _policy, _observer) = setup(config);

    assert_eq!(
        pipeline.enqueue(record("pkg", 1)).unwrap(),
        EnqueueOutcome::Enqueued
    );
    assert_eq!(
        pipeline.enqueue(record("pkg", 2)).unwrap(),
        EnqueueOutcome::Enqueued
    );
    assert_eq!(
        pipeline.enqueue(record("pkg", 3)).unwrap(),
        EnqueueOutcome::Dropped(DropReason::OverQuota)
    );
    // 其他包不受影响
    assert_eq!(
        pipeline.enqueue(record("other", 1)).unwrap(),
        EnqueueOutcome::Enqueued
    );
    // 已在线 key 的更新不算净增
    assert_eq!(
        pipeline.enqueue(record("pkg", 2)).unwrap(),
        EnqueueOutcome::Enqueued
    );
}

#[tokio::test]
async fn test_blocked_package_drops_silently() {
    let (pipeline, policy, observer) = setup(HubConfig::default());
    policy.block_package("pkg");

    assert_eq!(
        pipeline.enqueue(record("pkg", 1)).unwrap(),
        EnqueueOutcome::Dropped(DropReason::Blocked)
    );
    drain(&pipeline).await;

    assert_eq!(pipeline.stats().counters.dropped_blocked, 1);
    assert!(observer.events().is_empty());
}

#[tokio::test]
async fn test_missing_channel_drops() {
    let (pipeline, policy, _observer) = setup(HubConfig::default());
    policy.add_channel("pkg", ChannelInfo::new("alerts", Importance::High));

    let mut r = record("pkg", 1);
    r.channel_id = "missing".to_string();
    assert_eq!(
        pipeline.enqueue(r).unwrap(),
        EnqueueOutcome::Dropped(DropReason::NoChannel)
    );
    assert_eq!(pipeline.stats().counters.dropped_no_channel, 1);
}

#[tokio::test]
async fn test_channel_importance_overrides_record() {
    let (pipeline, policy, _observer) = setup(HubConfig::default());
    policy.add_channel("pkg", ChannelInfo::new("default", Importance::Min));

    pipeline
        .enqueue(record("pkg", 1).with_importance(Importance::High))
        .unwrap();
    drain(&pipeline).await;

    let posted = pipeline.get_record(&key("pkg", 1)).unwrap();
    assert_eq!(posted.importance, Importance::Min);
}

#[tokio::test]
async fn test_zen_change_reranks_synchronously() {
    let (pipeline, policy, observer) = setup(HubConfig::default());

    pipeline
        .enqueue(record("pkg", 1).with_importance(Importance::Default))
        .unwrap();
    pipeline
        .enqueue(record("pkg", 2).with_importance(Importance::High))
        .unwrap();
    drain(&pipeline).await;

    policy.set_zen(ZenMode::PriorityOnly);
    pipeline.policy_changed();
    drain(&pipeline).await;

    // DEFAULT 重要性在 PriorityOnly 下被拦截
    assert!(pipeline.get_record(&key("pkg", 1)).unwrap().is_intercepted);
    assert!(!pipeline.get_record(&key("pkg", 2)).unwrap().is_intercepted);
    assert!(observer.count_of(EventKind::RankingChanged) >= 1);
}

#[tokio::test]
async fn test_ranking_order_follows_importance() {
    let (pipeline, _policy, _observer) = setup(HubConfig::new().with_sparse_threshold(10));

    pipeline
        .enqueue(record("pkg", 1).with_importance(Importance::Low))
        .unwrap();
    pipeline
        .enqueue(record("pkg", 2).with_importance(Importance::High))
        .unwrap();
    pipeline
        .enqueue(record("pkg", 3).with_importance(Importance::Default))
        .unwrap();
    drain(&pipeline).await;

    let order: Vec<i32> = pipeline.ranked_keys().iter().map(|k| k.id).collect();
    assert_eq!(order, vec![2, 3, 1]);
}

#[tokio::test]
async fn test_snooze_until_time_and_wake() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;

    let wake = WakeCondition::At(chrono::Utc::now() + chrono::Duration::milliseconds(150));
    assert!(pipeline.snooze(&key("pkg", 1), wake, false));
    drain(&pipeline).await;

    let stats = pipeline.stats();
    assert_eq!(stats.live_posted, 0);
    assert_eq!(stats.snoozed, 1);
    assert_eq!(
        observer.removed(),
        vec![(key("pkg", 1).to_string(), RemoveReason::Snoozed)]
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    drain(&pipeline).await;

    // 到点唤醒后重发
    assert_eq!(pipeline.stats().live_posted, 1);
    assert_eq!(pipeline.stats().snoozed, 0);
    assert_eq!(observer.count_of(EventKind::Posted), 2);
}

#[tokio::test]
async fn test_snooze_criterion_mutes_on_return() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;

    assert!(pipeline.snooze(
        &key("pkg", 1),
        WakeCondition::Criterion("at-home".into()),
        true,
    ));
    drain(&pipeline).await;
    assert_eq!(pipeline.stats().snoozed, 1);

    pipeline.unsnooze_criterion("at-home");
    drain(&pipeline).await;

    let reposted = pipeline.get_record(&key("pkg", 1)).unwrap();
    assert!(reposted.post_silently);
}

#[tokio::test]
async fn test_enqueue_while_snoozed_reroutes_to_store() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;
    let wake = WakeCondition::At(chrono::Utc::now() + chrono::Duration::seconds(60));
    assert!(pipeline.snooze(&key("pkg", 1), wake, false));
    drain(&pipeline).await;

    let mut update = record("pkg", 1);
    update.payload = Payload::new("updated while snoozed", "text");
    assert_eq!(
        pipeline.enqueue(update).unwrap(),
        EnqueueOutcome::Snoozed
    );
    drain(&pipeline).await;

    // 更新进入延后存储，不发布
    assert_eq!(pipeline.stats().live_posted, 0);
    assert_eq!(pipeline.stats().snoozed, 1);
    assert_eq!(observer.count_of(EventKind::Posted), 1);
}

#[tokio::test]
async fn test_ttl_expiry_removes_with_timed_out() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    let mut r = record("pkg", 1);
    r.ttl = Some(Duration::from_millis(150));
    pipeline.enqueue(r).unwrap();
    drain(&pipeline).await;
    assert_eq!(pipeline.stats().live_posted, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    drain(&pipeline).await;

    assert_eq!(pipeline.stats().live_posted, 0);
    assert_eq!(
        observer.removed(),
        vec![(key("pkg", 1).to_string(), RemoveReason::TimedOut)]
    );
}

#[tokio::test]
async fn test_lifetime_extension_suppresses_app_cancel() {
    let config = HubConfig::default();
    let grace = config.lifetime_extension_grace;
    let (pipeline, _policy, observer) = setup(config);

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;
    pipeline.mark_host_flags(&key("pkg", 1), Flags::LIFETIME_EXTENDED);

    let outcome = pipeline.cancel(
        &key("pkg", 1),
        RemoveReason::AppCancel,
        Flags::NONE,
        Flags::NONE,
    );
    assert_eq!(outcome, CancelOutcome::Suppressed);
    drain(&pipeline).await;

    // 抑制后静默重发，记录还在线
    assert_eq!(pipeline.stats().live_posted, 1);
    assert!(pipeline.get_record(&key("pkg", 1)).unwrap().post_silently);
    assert_eq!(observer.count_of(EventKind::Posted), 2);

    // 宽限期后重试绕过抑制
    tokio::time::sleep(grace + Duration::from_millis(150)).await;
    drain(&pipeline).await;
    assert_eq!(pipeline.stats().live_posted, 0);
}

#[tokio::test]
async fn test_user_cancel_bypasses_lifetime_extension() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    drain(&pipeline).await;
    pipeline.mark_host_flags(&key("pkg", 1), Flags::LIFETIME_EXTENDED);

    let outcome = pipeline.cancel(
        &key("pkg", 1),
        RemoveReason::UserCancel,
        Flags::NONE,
        Flags::NONE,
    );
    assert_eq!(outcome, CancelOutcome::Removed);
    assert_eq!(pipeline.stats().live_posted, 0);
}

#[tokio::test]
async fn test_assistant_adjustment_applies_within_window() {
    struct Boost {
        pipeline: Mutex<Option<NotificationPipeline>>,
    }
    impl Assistant for Boost {
        fn name(&self) -> &str {
            "boost"
        }
        fn on_enqueued(&self, record: &NotificationRecord) {
            if let Some(p) = self.pipeline.lock().unwrap().as_ref() {
                p.apply_adjustments(&record.key, vec![Adjustment::ranking_score(1.0)]);
            }
        }
    }

    let config = HubConfig::new().with_assistant_window(Duration::from_millis(100));
    let (pipeline, _policy, _observer) = setup(config);
    let assistant = Arc::new(Boost {
        pipeline: Mutex::new(Some(pipeline.clone())),
    });
    pipeline.set_assistant(assistant);

    pipeline.enqueue(record("pkg", 1)).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drain(&pipeline).await;

    // 调整在发布前合并
    let posted = pipeline.get_record(&key("pkg", 1)).unwrap();
    assert_eq!(posted.rank_score, 1.0);
}

#[tokio::test]
async fn test_cancel_all_spares_protected_records() {
    let (pipeline, _policy, _observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    pipeline.enqueue(record("pkg", 2)).unwrap();
    pipeline
        .enqueue(record("pkg", 3).with_flags(Flags::NO_CLEAR))
        .unwrap();
    drain(&pipeline).await;

    let removed = pipeline.cancel_all("pkg", 0, RemoveReason::AppCancelAll);
    drain(&pipeline).await;

    assert_eq!(removed, 2);
    assert_eq!(pipeline.stats().live_posted, 1);
    assert!(pipeline.get_record(&key("pkg", 3)).is_some());
}

#[tokio::test]
async fn test_hide_and_unhide_package() {
    let (pipeline, _policy, observer) = setup(HubConfig::default());

    pipeline.enqueue(record("pkg", 1)).unwrap();
    pipeline.enqueue(record("other", 1)).unwrap();
    drain(&pipeline).await;

    pipeline.hide_package("pkg", 0);
    pipeline.unhide_package("pkg", 0);
    drain(&pipeline).await;

    let hidden: Vec<_> = observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HubEvent::Hidden { keys, .. } => Some(keys),
            _ => None,
        })
        .collect();
    assert_eq!(hidden.len(), 1);
    assert_eq!(hidden[0].len(), 1);
    assert_eq!(hidden[0][0].package, "pkg");
    assert_eq!(observer.count_of(EventKind::Unhidden), 1);
}

#[tokio::test]
async fn test_observer_package_filter_scopes_events() {
    let (pipeline, _policy, _all) = setup(HubConfig::default());
    let scoped = RecordingObserver::new();
    pipeline.register_observer(
        scoped.clone(),
        ObserverFilter::all().with_packages(["pkg".to_string()]),
    );

    pipeline.enqueue(record("pkg", 1)).unwrap();
    pipeline.enqueue(record("other", 1)).unwrap();
    drain(&pipeline).await;

    // 只看得到自己包的 Posted，快照也被裁剪
    assert_eq!(scoped.count_of(EventKind::Posted), 1);
    for event in scoped.events() {
        if let HubEvent::Posted { ranking, .. } = event {
            assert_eq!(ranking.len(), 1);
        }
    }
}

#[tokio::test]
async fn test_permits_balance_after_mixed_workload() {
    let config = HubConfig::new().with_max_live_per_package(3);
    let (pipeline, _policy, _observer) = setup(config);

    for i in 0..5 {
        let _ = pipeline.enqueue(record("pkg", i));
    }
    drain(&pipeline).await;
    pipeline.cancel(
        &key("pkg", 0),
        RemoveReason::UserCancel,
        Flags::NONE,
        Flags::NONE,
    );
    drain(&pipeline).await;

    // 每个许可恰好释放一次（posted / dropped / cancelled 任一终态）
    assert_eq!(pipeline.stats().permits_outstanding, 0);
}
