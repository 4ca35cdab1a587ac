//! Notification Hub CLI
//!
//! 通知管理引擎的诊断入口：查看历史、跑一遍演示管线

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use notification_hub::{
    ChannelInfo, HubConfig, HubEvent, HubObserver, HistoryStore, Importance, NotificationPipeline,
    NotificationRecord, ObserverFilter, Payload, RecordKey, RemoveReason, StaticPolicy,
};

#[derive(Parser)]
#[command(name = "nhub")]
#[command(about = "Notification Hub - 通知管理引擎")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 查看最近的通知历史
    History {
        /// 显示最近 N 条
        #[arg(long, short, default_value = "20")]
        limit: usize,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 跑一遍演示管线（入队、自动分组、取消级联）
    Demo,
}

/// 演示用观察者：把事件打到标准输出
struct ConsoleObserver;

impl HubObserver for ConsoleObserver {
    fn name(&self) -> &str {
        "console"
    }

    fn deliver(&self, event: &HubEvent) -> Result<()> {
        match event {
            HubEvent::Posted { record, ranking } => {
                println!(
                    "[posted]  {} \"{}\" (rank {}/{})",
                    record.key,
                    record.payload.title,
                    ranking
                        .position_of(&record.key.to_string())
                        .map(|p| p + 1)
                        .unwrap_or(0),
                    ranking.len()
                );
            }
            HubEvent::Removed { key, reason, .. } => {
                println!("[removed] {} ({})", key, reason);
            }
            HubEvent::RankingChanged { ranking } => {
                println!("[ranking] {} live", ranking.len());
            }
            HubEvent::Hidden { keys, .. } => {
                println!("[hidden]  {} records", keys.len());
            }
            HubEvent::Unhidden { keys, .. } => {
                println!("[shown]   {} records", keys.len());
            }
        }
        Ok(())
    }
}

fn print_history(limit: usize, json: bool) -> Result<()> {
    let store = HistoryStore::new(HistoryStore::default_path());
    let rows = store.read_recent(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("暂无历史记录");
        return Ok(());
    }
    for row in rows {
        println!(
            "{}  {:8}  {:10}  {}{}",
            row.ts.format("%Y-%m-%d %H:%M:%S"),
            row.event,
            row.importance,
            row.key,
            row.reason.map(|r| format!("  ({})", r)).unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_demo() -> Result<()> {
    let policy = Arc::new(StaticPolicy::new());
    policy.add_channel("com.example.chat", ChannelInfo::new("messages", Importance::High));

    let config = HubConfig::new()
        .with_assistant_window(Duration::ZERO)
        .with_cascade_grace(Duration::from_millis(200))
        .with_history_path(HistoryStore::default_path());
    let pipeline = NotificationPipeline::new(config, policy);
    pipeline.register_observer(Arc::new(ConsoleObserver), ObserverFilter::all());

    info!("Posting three sparse notifications to trigger auto-grouping");
    for i in 1..=3 {
        let record = NotificationRecord::new(
            RecordKey::new("com.example.chat", 0, None, i),
            10001,
            "messages",
            Payload::new(format!("消息 {}", i), "演示通知"),
        );
        pipeline.enqueue(record)?;
    }
    pipeline.settle().await;

    info!("Cancelling one child; the group demotes when it falls below two");
    pipeline.cancel(
        &RecordKey::new("com.example.chat", 0, None, 1),
        RemoveReason::AppCancel,
        notification_hub::Flags::NONE,
        notification_hub::Flags::NONE,
    );
    pipeline.cancel(
        &RecordKey::new("com.example.chat", 0, None, 2),
        RemoveReason::AppCancel,
        notification_hub::Flags::NONE,
        notification_hub::Flags::NONE,
    );
    pipeline.settle().await;

    let stats = pipeline.stats();
    println!(
        "\nposted={} removed={} live={} snoozed={}",
        stats.counters.posted, stats.counters.removed, stats.live_posted, stats.snoozed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug nhub demo
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("notification_hub=info,nhub=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::History { limit, json } => print_history(limit, json)?,
        Commands::Demo => run_demo().await?,
    }
    Ok(())
}
