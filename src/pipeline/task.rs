//! 管线任务 - 单工作者消费的带标签任务
//!
//! 所有异步/延迟工作都表达为显式任务变体，由单一工作者按提交顺序处理
//! （同一 key 的操作保持提交序）。延迟任务携带调度时的代次，
//! 取消/更新会提升代次使其作废（cancel-on-supersede）。

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::observer::RemoveReason;
use crate::record::{Flags, RecordKey};

#[derive(Debug)]
pub enum PipelineTask {
    /// 将 enqueued 记录发布（排名、分组、提醒、扇出）
    Post { key: RecordKey, epoch: u64 },
    /// 生命周期延长抑制后的取消重试
    RetryCancel {
        key: RecordKey,
        epoch: u64,
        reason: RemoveReason,
        must_have: Flags,
        must_not_have: Flags,
    },
    /// 摘要消失后的孤儿子通知清理（宽限期后）
    CascadeOrphans {
        package: String,
        user_id: i32,
        group_key: String,
    },
    /// 强制分组宽限期到期
    ForceGroup { key: RecordKey, epoch: u64 },
    /// 存活时长到期
    TtlExpire { key: RecordKey, epoch: u64 },
    /// 延后唤醒
    SnoozeWake { key: RecordKey },
    /// 重新排名（策略传播等）
    ReRank,
    /// 测试屏障：队列排空确认
    Barrier(oneshot::Sender<()>),
}

/// 延迟后提交任务（best-effort 计时器；工作者端用代次判废）
pub fn submit_after(tx: mpsc::UnboundedSender<PipelineTask>, task: PipelineTask, delay: Duration) {
    if delay.is_zero() {
        let _ = tx.send(task);
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(task);
    });
}
