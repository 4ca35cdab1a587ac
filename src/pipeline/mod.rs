//! 通知管线 - enqueue → rank → post → deliver 的编排核心
//!
//! 权威集合全部由单一互斥锁（串行化域）保护；发布/取消/分组/排名的
//! 读-改-写在临界区内整体完成。入队提交后立即返回，实际发布在单一
//! 工作者任务上异步执行（同一 key 的操作保持提交顺序）。事件在临界区
//! 外通过每观察者队列投递，慢观察者不会阻塞管线。
//!
//! 每 key 代次（epoch）实现 cancel-on-supersede：取消或更新会提升代次，
//! 携带旧代次的延迟任务（发布/TTL/强制分组/取消重试）到期后自动作废。

pub mod state;
pub mod task;

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::error::{CancelOutcome, DropReason, EnqueueOutcome, HubError};
use crate::grouping::{GroupPlan, GroupingEngine};
use crate::history::{HistoryRow, HistoryStore};
use crate::observer::{
    HubEvent, HubObserver, ObserverFilter, ObserverRegistry, ObserverToken, RankingSnapshot,
    RemoveReason,
};
use crate::policy::PolicyProvider;
use crate::ranking::RankingEngine;
use crate::rate_limit::RateLimiter;
use crate::record::{Adjustment, Flags, Importance, NotificationRecord, RecordKey};
use crate::snooze::{SnoozeStore, WakeCondition};
use crate::tracker::PermitTracker;

use state::{Counters, PipelineState};
use task::{submit_after, PipelineTask};

/// 助手协作方：入队时收到回调，可在延迟窗口内附加调整
pub trait Assistant: Send + Sync {
    fn name(&self) -> &str;
    fn on_enqueued(&self, record: &NotificationRecord);
}

/// 诊断快照
#[derive(Debug, Clone)]
pub struct HubStats {
    pub live_posted: usize,
    pub pending_enqueued: usize,
    pub snoozed: usize,
    pub counters: Counters,
    pub permits_outstanding: u64,
    pub observers: usize,
}

/// 临界区内累积、解锁后执行的副作用
#[derive(Default)]
struct Effects {
    events: Vec<HubEvent>,
    history: Vec<HistoryRow>,
}

struct PipelineInner {
    config: HubConfig,
    policy: Arc<dyn PolicyProvider>,
    ranking: RankingEngine,
    grouping: GroupingEngine,
    state: Mutex<PipelineState>,
    observers: ObserverRegistry,
    tracker: PermitTracker,
    assistant: Mutex<Option<Arc<dyn Assistant>>>,
    history: Option<HistoryStore>,
    tx: mpsc::UnboundedSender<PipelineTask>,
}

/// 通知管线
#[derive(Clone)]
pub struct NotificationPipeline {
    inner: Arc<PipelineInner>,
}

impl NotificationPipeline {
    /// 创建管线并启动工作者任务（必须在 Tokio 运行时内调用）
    pub fn new(config: HubConfig, policy: Arc<dyn PolicyProvider>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        let snooze = SnoozeStore::new(config.snooze_capacity_per_user);
        let rate = RateLimiter::new(config.enqueue_rate_window, config.max_enqueues_per_window);
        let history = config.history_path.clone().map(HistoryStore::new);

        let inner = Arc::new(PipelineInner {
            ranking: RankingEngine::new(config.sort_by_post_time),
            grouping: GroupingEngine::new(config.sparse_group_threshold),
            state: Mutex::new(PipelineState::new(snooze, rate)),
            observers: ObserverRegistry::new(),
            tracker: PermitTracker::new().with_max_hold(Duration::from_secs(10)),
            assistant: Mutex::new(None),
            history,
            tx,
            config,
            policy,
        });

        tokio::spawn(worker_loop(Arc::clone(&inner), rx));
        info!("Notification pipeline started");
        Self { inner }
    }

    // ---- 观察者 / 助手 ----

    pub fn register_observer(
        &self,
        observer: Arc<dyn HubObserver>,
        filter: ObserverFilter,
    ) -> ObserverToken {
        self.inner.observers.register(observer, filter)
    }

    pub fn unregister_observer(&self, token: ObserverToken) {
        self.inner.observers.unregister(token);
    }

    pub fn set_assistant(&self, assistant: Arc<dyn Assistant>) {
        info!(assistant = assistant.name(), "Assistant registered");
        *self.inner.assistant.lock().expect("assistant lock poisoned") = Some(assistant);
    }

    /// 助手回调：在延迟窗口内（或发布后）附加调整
    pub fn apply_adjustments(&self, key: &RecordKey, adjustments: Vec<Adjustment>) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            if let Some(r) = st.enqueued.get_mut(key) {
                // 发布前：缓存，发布时统一合并
                r.adjustments.extend(adjustments);
            } else if let Some(r) = st.posted.get_mut(key) {
                r.adjustments.extend(adjustments);
                r.apply_adjustments();
                let ranking = self.inner.rank_locked(&mut st);
                effects.events.push(HubEvent::RankingChanged { ranking });
            } else {
                debug!(key = %key, "Adjustment for unknown key ignored");
            }
        }
        self.inner.apply_effects(effects);
    }

    // ---- 入队 ----

    /// 入队一条候选记录
    ///
    /// 同 key 入队是更新而非重复；被策略丢弃时静默返回 `Dropped`
    /// （宿主 API 的 fire-and-forget 语义），只有调用方误用才报错。
    pub fn enqueue(&self, mut record: NotificationRecord) -> Result<EnqueueOutcome, HubError> {
        if record.key.package.trim().is_empty() {
            return Err(HubError::InvalidArgument("package must not be empty".into()));
        }
        if record.payload.title.is_empty() && record.payload.text.is_empty() {
            return Err(HubError::InvalidArgument("payload must not be empty".into()));
        }

        // 修正：剥离调用方无权设置的标志，补默认 TTL
        record.flags.remove(Flags::CALLER_IMMUTABLE);
        if record.ttl.is_none() {
            record.ttl = self.inner.config.default_ttl;
        }

        let key = record.key.clone();

        // 通道解析（失败则丢弃并记诊断，不发任何事件）
        let channel = match self.inner.policy.resolve_channel(
            &key.package,
            key.user_id,
            &record.channel_id,
        ) {
            Some(ch) => ch,
            None => {
                warn!(key = %key, channel = %record.channel_id, "Dropping enqueue: channel does not exist");
                self.lock_state().counters.dropped_no_channel += 1;
                return Ok(EnqueueOutcome::Dropped(DropReason::NoChannel));
            }
        };
        if channel.importance != Importance::Default {
            record.importance = channel.importance;
            record.requested_importance = channel.importance;
        }

        if self.inner.policy.is_blocked(&key.package, &record.channel_id) {
            debug!(key = %key, "Dropping enqueue: blocked by policy");
            self.lock_state().counters.dropped_blocked += 1;
            return Ok(EnqueueOutcome::Dropped(DropReason::Blocked));
        }

        let record_for_assistant = record.clone();
        let assistant = {
            let mut st = self.lock_state();

            if !st.rate.allow(&key.package, key.user_id) {
                st.counters.dropped_rate_limited += 1;
                debug!(key = %key, "Dropping enqueue: rate limited");
                return Ok(EnqueueOutcome::Dropped(DropReason::RateLimited));
            }

            // 该 key 有挂起的 snooze：改道更新存储内容，不发布
            if st.snooze.is_snoozed(&key) {
                if let Some(entry) = st.snooze.take(&key) {
                    let wake = entry.wake;
                    let mute = entry.mute_on_return;
                    st.snooze.snooze_batch(vec![(record, wake, mute)]);
                }
                debug!(key = %key, "Enqueue re-routed to snooze store");
                return Ok(EnqueueOutcome::Snoozed);
            }

            // 配额：更新不算净增
            let is_update = st.enqueued.contains_key(&key) || st.posted.contains_key(&key);
            if !is_update
                && !record.flags.contains(Flags::FOREGROUND_SERVICE)
                && st.live_count(&key.package, key.user_id)
                    >= self.inner.config.max_live_per_package
            {
                st.counters.dropped_over_quota += 1;
                debug!(key = %key, "Dropping enqueue: over quota");
                return Ok(EnqueueOutcome::Dropped(DropReason::OverQuota));
            }

            // 更新语义：继承旧版本的时间戳/提醒历史
            if let Some(prev) = st.posted.get(&key).or_else(|| st.enqueued.get(&key)) {
                record.inherit_from(prev);
            }

            // 取代任何在途的同 key 发布
            if let Some(old) = st.permits.remove(&key) {
                old.cancel();
            }
            let epoch = st.bump_epoch(&key);
            st.permits
                .insert(key.clone(), self.inner.tracker.acquire(key.to_string()));

            let ttl = record.ttl;
            st.enqueued.insert(key.clone(), record);
            st.counters.enqueued += 1;

            let assistant = self
                .inner
                .assistant
                .lock()
                .expect("assistant lock poisoned")
                .clone();
            let delay = if assistant.is_some() {
                self.inner.config.assistant_window
            } else {
                Duration::ZERO
            };
            submit_after(
                self.inner.tx.clone(),
                PipelineTask::Post {
                    key: key.clone(),
                    epoch,
                },
                delay,
            );
            if let Some(ttl) = ttl {
                submit_after(
                    self.inner.tx.clone(),
                    PipelineTask::TtlExpire {
                        key: key.clone(),
                        epoch,
                    },
                    ttl,
                );
            }
            assistant
        };

        if let Some(a) = assistant {
            a.on_enqueued(&record_for_assistant);
        }
        Ok(EnqueueOutcome::Enqueued)
    }

    /// 宿主标记：为在线记录附加系统级标志
    /// （前台服务提升、生命周期延长等，调用方入队时无权设置）
    pub fn mark_host_flags(&self, key: &RecordKey, add: Flags) {
        let mut st = self.lock_state();
        if let Some(r) = st.posted.get_mut(key) {
            r.flags.insert(add);
            return;
        }
        if let Some(r) = st.enqueued.get_mut(key) {
            r.flags.insert(add);
        }
    }

    // ---- 取消 ----

    pub fn cancel(
        &self,
        key: &RecordKey,
        reason: RemoveReason,
        must_have: Flags,
        must_not_have: Flags,
    ) -> CancelOutcome {
        self.inner
            .cancel_inner(key, reason, must_have, must_not_have, false)
    }

    /// 取消某 (package, user) 的全部非豁免通知
    pub fn cancel_all(&self, package: &str, user_id: i32, reason: RemoveReason) -> usize {
        let keys: Vec<RecordKey> = {
            let st = self.lock_state();
            st.posted
                .keys()
                .chain(st.enqueued.keys())
                .filter(|k| k.package == package && k.user_id == user_id)
                .cloned()
                .collect()
        };
        let mut removed = 0;
        for key in keys {
            let outcome = self.inner.cancel_inner(
                &key,
                reason,
                Flags::NONE,
                Flags::FOREGROUND_SERVICE | Flags::NO_CLEAR,
                false,
            );
            if outcome == CancelOutcome::Removed {
                removed += 1;
            }
        }
        removed
    }

    // ---- 延后 ----

    /// 延后一条已发布的通知；摘要连同子通知作为一个批次（全进或全拒）
    pub fn snooze(&self, key: &RecordKey, wake: WakeCondition, mute_on_return: bool) -> bool {
        let mut effects = Effects::default();
        let ok = {
            let mut st = self.lock_state();
            let Some(target) = st.posted.get(key) else {
                return false;
            };

            let mut batch_keys = vec![key.clone()];
            if target.is_summary() {
                if let Some(gk) = target.effective_group_key().map(|s| s.to_string()) {
                    batch_keys.extend(st.group_children(&key.package, key.user_id, &gk));
                }
            }
            if !st.snooze.can_snooze(key.user_id, batch_keys.len()) {
                debug!(key = %key, n = batch_keys.len(), "Snooze rejected: capacity");
                return false;
            }

            let mut removed_for_events = Vec::new();
            let mut removed_records = Vec::new();
            let mut batch = Vec::new();
            for k in &batch_keys {
                if let Some(r) = self.inner.remove_posted_locked(&mut st, k) {
                    removed_for_events.push((k.clone(), r.importance));
                    removed_records.push(r.clone());
                    batch.push((r, wake.clone(), mute_on_return));
                }
            }
            st.snooze.snooze_batch(batch);

            // 移除后组可能跌破 2 条子通知：与取消/TTL 路径相同的降级检查
            for r in &removed_records {
                self.inner
                    .apply_demote_check(&mut st, r, &mut removed_for_events);
            }

            if let WakeCondition::At(t) = &wake {
                let delay = (*t - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                for k in &batch_keys {
                    submit_after(
                        self.inner.tx.clone(),
                        PipelineTask::SnoozeWake { key: k.clone() },
                        delay,
                    );
                }
            }

            let ranking = self.inner.rank_locked(&mut st);
            for (k, importance) in removed_for_events {
                self.inner.push_removed(
                    &mut effects,
                    k,
                    RemoveReason::Snoozed,
                    importance,
                    ranking.clone(),
                );
            }
            true
        };
        self.inner.apply_effects(effects);
        ok
    }

    /// 立即唤醒并重发一条延后的通知
    pub fn unsnooze(&self, key: &RecordKey) {
        let _ = self.inner.tx.send(PipelineTask::SnoozeWake { key: key.clone() });
    }

    /// 条件达成：唤醒等待该条件的全部记录（"mute on return" 生效）
    pub fn unsnooze_criterion(&self, criterion: &str) {
        let mut st = self.lock_state();
        let entries = st.snooze.take_for_criterion(criterion);
        for entry in entries {
            let mut record = entry.record;
            record.post_silently = entry.mute_on_return;
            self.inner.reinject_locked(&mut st, record);
        }
    }

    /// 重发指定用户的全部延后通知
    pub fn repost_all(&self, user_ids: &[i32]) {
        let mut st = self.lock_state();
        let entries = st.snooze.take_for_users(user_ids);
        for entry in entries {
            self.inner.reinject_locked(&mut st, entry.record);
        }
    }

    /// 重发某组的摘要与子通知
    pub fn repost_group_summary(&self, package: &str, user_id: i32, group_key: &str) {
        let mut st = self.lock_state();
        let entries = st.snooze.take_group(package, user_id, group_key);
        for entry in entries {
            self.inner.reinject_locked(&mut st, entry.record);
        }
    }

    /// 直接取消延后记录（不重发、不发事件）
    pub fn cancel_snoozed(&self, user_id: i32, package: &str, tag: Option<&str>, id: Option<i32>) -> usize {
        self.lock_state().snooze.cancel(user_id, package, tag, id)
    }

    // ---- 策略传播 / 可见性 ----

    /// 策略变化（zen 切换等）：同步重算拦截与排名
    pub fn policy_changed(&self) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            let before: Vec<(RecordKey, bool)> = st
                .order
                .iter()
                .filter_map(|k| st.posted.get(k).map(|r| (k.clone(), r.is_intercepted)))
                .collect();
            let ranking = self.inner.rank_locked(&mut st);
            let after: Vec<(RecordKey, bool)> = st
                .order
                .iter()
                .filter_map(|k| st.posted.get(k).map(|r| (k.clone(), r.is_intercepted)))
                .collect();
            if before != after {
                effects.events.push(HubEvent::RankingChanged { ranking });
            }
        }
        self.inner.apply_effects(effects);
    }

    /// 隐藏某 (package, user) 的全部在线通知（如应用被挂起）
    pub fn hide_package(&self, package: &str, user_id: i32) {
        self.inner.publish_visibility(package, user_id, true);
    }

    pub fn unhide_package(&self, package: &str, user_id: i32) {
        self.inner.publish_visibility(package, user_id, false);
    }

    // ---- 查询 / 诊断 ----

    /// 等待工作者处理完当前已排队的任务（测试/诊断用屏障）
    pub async fn settle(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.tx.send(PipelineTask::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// 当前排名顺序的 key 列表
    pub fn ranked_keys(&self) -> Vec<RecordKey> {
        self.lock_state().order.clone()
    }

    pub fn get_record(&self, key: &RecordKey) -> Option<NotificationRecord> {
        self.lock_state().posted.get(key).cloned()
    }

    pub fn stats(&self) -> HubStats {
        let st = self.lock_state();
        HubStats {
            live_posted: st.posted.len(),
            pending_enqueued: st.enqueued.len(),
            snoozed: st.snooze.len(),
            counters: st.counters.clone(),
            permits_outstanding: self.inner.tracker.stats().outstanding(),
            observers: self.inner.observers.observer_count(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.inner.state.lock().expect("pipeline lock poisoned")
    }
}

impl PipelineInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().expect("pipeline lock poisoned")
    }

    /// 排名：按上次顺序（新记录附加在尾部）喂给引擎，保持平局稳定
    fn rank_locked(&self, st: &mut PipelineState) -> RankingSnapshot {
        let snapshot = self.policy.snapshot();

        let mut keys: Vec<RecordKey> = st
            .order
            .iter()
            .filter(|k| st.posted.contains_key(k))
            .cloned()
            .collect();
        for k in st.posted.keys() {
            if !keys.contains(k) {
                keys.push(k.clone());
            }
        }

        let new_order = {
            let mut by_key: std::collections::HashMap<RecordKey, &mut NotificationRecord> = st
                .posted
                .iter_mut()
                .map(|(k, v)| (k.clone(), v))
                .collect();
            let mut refs: Vec<&mut NotificationRecord> =
                keys.iter().filter_map(|k| by_key.remove(k)).collect();
            self.ranking.rank(&mut refs, self.policy.as_ref(), &snapshot)
        };
        st.order = new_order;
        RankingSnapshot::from_ordered(&st.ordered_posted())
    }

    /// 从 posted 移除并清理所有关联状态；返回被移除的记录
    fn remove_posted_locked(
        &self,
        st: &mut PipelineState,
        key: &RecordKey,
    ) -> Option<NotificationRecord> {
        let record = st.posted.remove(key)?;
        st.order.retain(|k| k != key);
        st.epochs.remove(key);
        if let Some(permit) = st.permits.remove(key) {
            permit.cancel();
        }
        st.counters.removed += 1;
        if record.is_summary() {
            st.rebuild_summary_index();
        }
        Some(record)
    }

    fn push_removed(
        &self,
        effects: &mut Effects,
        key: RecordKey,
        reason: RemoveReason,
        importance: Importance,
        ranking: RankingSnapshot,
    ) {
        effects.history.push(HistoryRow {
            ts: Utc::now(),
            key: key.to_string(),
            package: key.package.clone(),
            user_id: key.user_id,
            event: "removed".to_string(),
            reason: Some(reason.as_str().to_string()),
            importance,
        });
        effects.events.push(HubEvent::Removed {
            key,
            reason,
            ranking,
        });
    }

    fn push_posted(&self, effects: &mut Effects, record: NotificationRecord, ranking: RankingSnapshot) {
        effects.history.push(HistoryRow {
            ts: Utc::now(),
            key: record.key.to_string(),
            package: record.key.package.clone(),
            user_id: record.key.user_id,
            event: "posted".to_string(),
            reason: None,
            importance: record.importance,
        });
        effects.events.push(HubEvent::Posted { record, ranking });
    }

    /// 解锁后执行副作用：事件扇出 + 历史落盘
    fn apply_effects(&self, effects: Effects) {
        for event in &effects.events {
            self.observers.publish(event);
        }
        if let Some(history) = &self.history {
            for row in &effects.history {
                if let Err(e) = history.append(row) {
                    warn!(error = %e, "Failed to append history row");
                }
            }
        }
    }

    /// 将记录重新注入入队路径（snooze 唤醒等；跳过限流/配额）
    fn reinject_locked(&self, st: &mut PipelineState, record: NotificationRecord) {
        let key = record.key.clone();
        if let Some(old) = st.permits.remove(&key) {
            old.cancel();
        }
        let epoch = st.bump_epoch(&key);
        st.permits
            .insert(key.clone(), self.tracker.acquire(key.to_string()));
        st.enqueued.insert(key.clone(), record);
        st.counters.enqueued += 1;
        let _ = self.tx.send(PipelineTask::Post { key, epoch });
    }

    // ---- 发布 ----

    fn handle_post(&self, key: RecordKey, epoch: u64) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            if st.current_epoch(&key) != Some(epoch) {
                debug!(key = %key, "Post superseded, skipping");
                return;
            }
            let Some(mut record) = st.enqueued.remove(&key) else {
                // 发布前已被取消（预期内的竞态）：静默 no-op
                if let Some(permit) = st.permits.remove(&key) {
                    permit.cancel();
                }
                return;
            };

            // 延迟窗口内策略可能已变化：重新校验屏蔽
            if self.policy.is_blocked(&key.package, &record.channel_id) {
                debug!(key = %key, "Dropping at post: blocked by policy");
                st.counters.dropped_blocked += 1;
                st.epochs.remove(&key);
                if let Some(permit) = st.permits.remove(&key) {
                    permit.cancel();
                }
                return;
            }

            record.apply_adjustments();
            // 摘要与子通知标志互斥，摘要优先
            if record.is_summary() && record.is_child() {
                record.flags.remove(Flags::GROUP_CHILD);
            }

            let prev = st.posted.insert(key.clone(), record);
            let interruptive = match &prev {
                Some(p) => st.posted[&key].payload.interruptive_diff(&p.payload),
                None => true,
            };

            // 分组：稀疏自动分组（摘要创建/合并在同一临界区内完成）
            let created_summary = self.apply_autogroup(&mut st, &key);

            // 强制分组（宿主策略）：宽限期后仍未分组则并入合成组
            if self.config.force_grouping && st.posted[&key].is_sparse() {
                submit_after(
                    self.tx.clone(),
                    PipelineTask::ForceGroup {
                        key: key.clone(),
                        epoch,
                    },
                    self.config.force_grouping_grace,
                );
            }

            let ranking = self.rank_locked(&mut st);

            // 提醒决策：每次打扰性内容变化至多一次
            if let Some(r) = st.posted.get_mut(&key) {
                let alert = interruptive
                    && !r.post_silently
                    && !r.is_intercepted
                    && !r.flags.intersects(Flags::FOREGROUND_SERVICE | Flags::BUBBLE);
                if alert {
                    r.last_audibly_alerted = Some(Utc::now());
                }
            }

            st.rebuild_summary_index();
            st.counters.posted += 1;
            if let Some(permit) = st.permits.remove(&key) {
                permit.finish();
            }

            self.push_posted(&mut effects, st.posted[&key].clone(), ranking.clone());
            if let Some(sk) = created_summary {
                if let Some(summary) = st.posted.get(&sk).cloned() {
                    st.counters.posted += 1;
                    self.push_posted(&mut effects, summary, ranking);
                }
            }
        }
        self.apply_effects(effects);
    }

    /// 发布后的自动分组检查；返回新创建的合成摘要 key
    fn apply_autogroup(&self, st: &mut PipelineState, key: &RecordKey) -> Option<RecordKey> {
        let plan = {
            let live: Vec<&NotificationRecord> = st.posted.values().collect();
            let record = st.posted.get(key)?;
            self.grouping.on_posted(record, &live)
        };
        match plan {
            Some(GroupPlan::Promote {
                group_key,
                members,
                attrs,
            }) => self.apply_promote(st, key, group_key, members, attrs),
            _ => None,
        }
    }

    /// 应用 Promote 计划；返回新创建的合成摘要 key（已有摘要则合并）
    fn apply_promote(
        &self,
        st: &mut PipelineState,
        trigger: &RecordKey,
        group_key: String,
        members: Vec<RecordKey>,
        attrs: crate::grouping::SummaryAttrs,
    ) -> Option<RecordKey> {
        for k in &members {
            if let Some(r) = st.posted.get_mut(k) {
                if r.is_summary() {
                    continue;
                }
                r.override_group_key = Some(group_key.clone());
                r.flags.insert(Flags::GROUP_CHILD);
            }
        }
        st.rebuild_summary_index();

        // 同一临界区内再次检查索引：已有摘要则并入，绝不产生重复摘要
        if let Some(existing) = st
            .summary_index
            .get(&(trigger.package.clone(), trigger.user_id, group_key.clone()))
            .cloned()
        {
            if let Some(s) = st.posted.get_mut(&existing) {
                s.payload.icon = attrs.icon;
                s.payload.color = attrs.color;
                s.payload.visibility = attrs.visibility;
                s.flags.insert(attrs.flags);
                s.update_time = Utc::now();
            }
            return None;
        }

        let (uid, channel_id) = match st.posted.get(trigger) {
            Some(r) => (r.uid, r.channel_id.clone()),
            None => return None,
        };
        let summary = self.grouping.make_summary(
            &trigger.package,
            trigger.user_id,
            uid,
            &channel_id,
            &group_key,
            &attrs,
        );
        let skey = summary.key.clone();

        if st.posted.contains_key(&skey) {
            // 固定摘要 key 已被占用：记录冲突并合并，不崩溃
            error!(key = %skey, group_key = %group_key, "Duplicate summary detected, merging defensively");
            st.counters.cascade_conflicts += 1;
            return None;
        }

        st.bump_epoch(&skey);
        st.posted.insert(skey.clone(), summary);
        st.rebuild_summary_index();
        Some(skey)
    }

    /// 移除后的降级检查：组低于 2 条子通知时拆组
    fn apply_demote_check(
        &self,
        st: &mut PipelineState,
        removed: &NotificationRecord,
        pending_removed: &mut Vec<(RecordKey, Importance)>,
    ) {
        let plan = {
            let live: Vec<&NotificationRecord> = st.posted.values().collect();
            self.grouping.on_removed(removed, &live)
        };
        let Some(GroupPlan::Demote {
            synthetic,
            summary_key,
            members,
            ..
        }) = plan
        else {
            return;
        };

        if synthetic {
            if let Some(sk) = summary_key {
                if let Some(s) = self.remove_posted_locked(st, &sk) {
                    pending_removed.push((sk, s.importance));
                }
            }
            for k in &members {
                if let Some(r) = st.posted.get_mut(k) {
                    r.override_group_key = None;
                    r.flags.remove(Flags::GROUP_CHILD);
                }
            }
        } else if let Some(sk) = summary_key {
            // 应用组：剥离摘要标志，单条通知不再以组呈现
            if let Some(s) = st.posted.get_mut(&sk) {
                s.flags.remove(Flags::GROUP_SUMMARY);
            }
        }
        st.rebuild_summary_index();
    }

    // ---- 取消 ----

    fn cancel_inner(
        &self,
        key: &RecordKey,
        reason: RemoveReason,
        must_have: Flags,
        must_not_have: Flags,
        bypass_lifetime: bool,
    ) -> CancelOutcome {
        let mut effects = Effects::default();
        let outcome = {
            let mut st = self.lock_state();

            let in_posted = st.posted.contains_key(key);
            let in_enqueued = st.enqueued.contains_key(key);

            if !in_posted && !in_enqueued {
                // 延后存储中的取消：移除但不发事件（从未可见）
                if st.snooze.take(key).is_some() {
                    st.epochs.remove(key);
                    debug!(key = %key, "Cancelled snoozed record");
                    return CancelOutcome::RemovedFromSnooze;
                }
                debug!(key = %key, "Cancel found no record (race no-op)");
                return CancelOutcome::NoOp;
            }

            let record = st
                .posted
                .get(key)
                .or_else(|| st.enqueued.get(key))
                .cloned()
                .expect("record just checked present");

            if !record.flags.matches(must_have, must_not_have) {
                debug!(key = %key, "Cancel rejected by flag preconditions");
                return CancelOutcome::Rejected;
            }

            // 生命周期延长：抑制移除，改为静默重发并安排重试
            if !bypass_lifetime
                && in_posted
                && record.flags.contains(Flags::LIFETIME_EXTENDED)
                && reason == RemoveReason::AppCancel
            {
                if let Some(r) = st.posted.get_mut(key) {
                    r.post_silently = true;
                }
                let ranking = self.rank_locked(&mut st);
                self.push_posted(&mut effects, st.posted[key].clone(), ranking);
                let epoch = st.bump_epoch(key);
                submit_after(
                    self.tx.clone(),
                    PipelineTask::RetryCancel {
                        key: key.clone(),
                        epoch,
                        reason,
                        must_have,
                        must_not_have,
                    },
                    self.config.lifetime_extension_grace,
                );
                debug!(key = %key, "Removal suppressed by lifetime extension");
                drop(st);
                self.apply_effects(effects);
                return CancelOutcome::Suppressed;
            }

            let mut pending_removed: Vec<(RecordKey, Importance)> = Vec::new();

            if record.is_summary() {
                if let Some(gk) = record.effective_group_key().map(|s| s.to_string()) {
                    if reason == RemoveReason::UserCancel {
                        // 用户消除摘要：同一临界区内级联（逐子通知做相同标志检查，
                        // 被豁免的子通知——如气泡——幸存）
                        for child_key in st.group_children(&key.package, key.user_id, &gk) {
                            let ok = st
                                .posted
                                .get(&child_key)
                                .map_or(false, |c| c.flags.matches(must_have, must_not_have));
                            if ok {
                                if let Some(c) = self.remove_posted_locked(&mut st, &child_key) {
                                    pending_removed.push((child_key, c.importance));
                                }
                            }
                        }
                    } else {
                        // 应用直接移除摘要：给应用一个批量更新的宽限期，
                        // 到期仍无摘要则清理孤儿
                        submit_after(
                            self.tx.clone(),
                            PipelineTask::CascadeOrphans {
                                package: key.package.clone(),
                                user_id: key.user_id,
                                group_key: gk,
                            },
                            self.config.cascade_grace,
                        );
                    }
                }
            }

            let removed = if in_posted {
                // 同 key 的在途更新一并撤销
                st.enqueued.remove(key);
                self.remove_posted_locked(&mut st, key)
            } else {
                let r = st.enqueued.remove(key);
                st.epochs.remove(key);
                if let Some(permit) = st.permits.remove(key) {
                    permit.cancel();
                }
                r
            };

            if let Some(rec) = &removed {
                if in_posted {
                    pending_removed.push((key.clone(), rec.importance));
                    self.apply_demote_check(&mut st, rec, &mut pending_removed);
                }
            }

            let ranking = self.rank_locked(&mut st);
            for (k, importance) in pending_removed {
                self.push_removed(&mut effects, k, reason, importance, ranking.clone());
            }
            CancelOutcome::Removed
        };
        self.apply_effects(effects);
        outcome
    }

    // ---- 延迟任务处理 ----

    fn handle_retry_cancel(
        &self,
        key: RecordKey,
        epoch: u64,
        reason: RemoveReason,
        must_have: Flags,
        must_not_have: Flags,
    ) {
        {
            let st = self.lock_state();
            if st.current_epoch(&key) != Some(epoch) {
                debug!(key = %key, "Suppressed-cancel retry superseded");
                return;
            }
        }
        // 重试时绕过抑制（应用本应在宽限期内自行更新）
        let _ = self.cancel_inner(&key, reason, must_have, must_not_have, true);
    }

    fn handle_cascade_orphans(&self, package: String, user_id: i32, group_key: String) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            // 应用在宽限期内补发了新摘要：不清理
            if st.summary_for(&package, user_id, &group_key).is_some() {
                return;
            }
            let orphans = {
                let live: Vec<&NotificationRecord> = st.posted.values().collect();
                self.grouping
                    .orphaned_children(&package, user_id, &group_key, &live)
            };
            if orphans.is_empty() {
                return;
            }
            let mut pending_removed = Vec::new();
            for k in orphans {
                let protected = st
                    .posted
                    .get(&k)
                    .map_or(true, |r| r.flags.contains(Flags::FOREGROUND_SERVICE));
                if protected {
                    continue;
                }
                if let Some(r) = self.remove_posted_locked(&mut st, &k) {
                    pending_removed.push((k, r.importance));
                }
            }
            let ranking = self.rank_locked(&mut st);
            for (k, importance) in pending_removed {
                self.push_removed(
                    &mut effects,
                    k,
                    RemoveReason::GroupSummaryCanceled,
                    importance,
                    ranking.clone(),
                );
            }
        }
        self.apply_effects(effects);
    }

    fn handle_force_group(&self, key: RecordKey, epoch: u64) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            if st.current_epoch(&key) != Some(epoch) {
                return;
            }
            let plan = {
                let live: Vec<&NotificationRecord> = st.posted.values().collect();
                match st.posted.get(&key) {
                    // 宽限期内已获得分组：no-op
                    Some(r) => self.grouping.force_group(r, &live),
                    None => None,
                }
            };
            let Some(GroupPlan::Promote {
                group_key,
                members,
                attrs,
            }) = plan
            else {
                return;
            };
            let created = self.apply_promote(&mut st, &key, group_key, members, attrs);
            let ranking = self.rank_locked(&mut st);
            if let Some(sk) = created {
                if let Some(summary) = st.posted.get(&sk).cloned() {
                    st.counters.posted += 1;
                    self.push_posted(&mut effects, summary, ranking.clone());
                }
            }
            effects.events.push(HubEvent::RankingChanged { ranking });
        }
        self.apply_effects(effects);
    }

    fn handle_ttl_expire(&self, key: RecordKey, epoch: u64) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            if st.current_epoch(&key) != Some(epoch) {
                return;
            }
            if st.enqueued.remove(&key).is_some() {
                st.epochs.remove(&key);
                if let Some(permit) = st.permits.remove(&key) {
                    permit.cancel();
                }
                return;
            }
            let Some(removed) = self.remove_posted_locked(&mut st, &key) else {
                return;
            };
            let mut pending_removed = vec![(key.clone(), removed.importance)];
            self.apply_demote_check(&mut st, &removed, &mut pending_removed);
            let ranking = self.rank_locked(&mut st);
            for (k, importance) in pending_removed {
                self.push_removed(
                    &mut effects,
                    k,
                    RemoveReason::TimedOut,
                    importance,
                    ranking.clone(),
                );
            }
        }
        self.apply_effects(effects);
    }

    fn handle_snooze_wake(&self, key: RecordKey) {
        let mut st = self.lock_state();
        let Some(entry) = st.snooze.take(&key) else {
            return;
        };
        let mut record = entry.record;
        record.post_silently = entry.mute_on_return;
        self.reinject_locked(&mut st, record);
    }

    fn handle_rerank(&self) {
        let mut effects = Effects::default();
        {
            let mut st = self.lock_state();
            let before = st.order.clone();
            let ranking = self.rank_locked(&mut st);
            if st.order != before {
                effects.events.push(HubEvent::RankingChanged { ranking });
            }
        }
        self.apply_effects(effects);
    }

    fn publish_visibility(&self, package: &str, user_id: i32, hidden: bool) {
        let mut effects = Effects::default();
        {
            let st = self.lock_state();
            let keys: Vec<RecordKey> = st
                .posted
                .keys()
                .filter(|k| k.package == package && k.user_id == user_id)
                .cloned()
                .collect();
            if keys.is_empty() {
                return;
            }
            let ranking = RankingSnapshot::from_ordered(&st.ordered_posted());
            effects.events.push(if hidden {
                HubEvent::Hidden { keys, ranking }
            } else {
                HubEvent::Unhidden { keys, ranking }
            });
        }
        self.apply_effects(effects);
    }
}

/// 单工作者循环：按提交顺序串行处理任务
async fn worker_loop(inner: Arc<PipelineInner>, mut rx: mpsc::UnboundedReceiver<PipelineTask>) {
    while let Some(task) = rx.recv().await {
        match task {
            PipelineTask::Post { key, epoch } => inner.handle_post(key, epoch),
            PipelineTask::RetryCancel {
                key,
                epoch,
                reason,
                must_have,
                must_not_have,
            } => inner.handle_retry_cancel(key, epoch, reason, must_have, must_not_have),
            PipelineTask::CascadeOrphans {
                package,
                user_id,
                group_key,
            } => inner.handle_cascade_orphans(package, user_id, group_key),
            PipelineTask::ForceGroup { key, epoch } => inner.handle_force_group(key, epoch),
            PipelineTask::TtlExpire { key, epoch } => inner.handle_ttl_expire(key, epoch),
            PipelineTask::SnoozeWake { key } => inner.handle_snooze_wake(key),
            PipelineTask::ReRank => inner.handle_rerank(),
            PipelineTask::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Pipeline worker stopped");
}
