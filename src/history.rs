//! 历史日志 - 发布/移除事件的本地 JSONL 追加写
//!
//! 诊断用途：记录每条通知的 posted/removed 事件，带文件锁，
//! 超过上限时定期裁剪到最近 N 条。路径可配置，默认在用户配置目录。

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::record::Importance;

/// 历史记录行（JSONL 格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    /// ISO8601 时间戳
    pub ts: DateTime<Utc>,
    /// 记录标识（字符串形式）
    pub key: String,
    /// 来源包名
    pub package: String,
    /// 用户
    pub user_id: i32,
    /// 事件："posted" 或 "removed"
    pub event: String,
    /// 移除原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// 当时的重要性
    pub importance: Importance,
}

const MAX_ROWS: usize = 200;
const KEEP_AFTER_CLEANUP: usize = 100;
const CLEANUP_CHECK_INTERVAL: usize = 10;

/// 历史存储
pub struct HistoryStore {
    path: PathBuf,
    write_count: AtomicUsize,
}

impl HistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_count: AtomicUsize::new(0),
        }
    }

    /// 默认存储路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("notification-hub")
            .join("history.jsonl")
    }

    /// 追加一行（带文件锁）
    pub fn append(&self, row: &HistoryRow) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;
        let mut file = file;
        writeln!(file, "{}", serde_json::to_string(row)?)?;
        file.unlock()?;

        self.maybe_cleanup();
        Ok(())
    }

    /// 读取最近 N 行
    pub fn read_recent(&self, n: usize) -> Vec<HistoryRow> {
        if !self.path.exists() {
            return Vec::new();
        }
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let reader = BufReader::new(file);
        let rows: Vec<HistoryRow> = reader
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        let start = rows.len().saturating_sub(n);
        let mut recent = rows[start..].to_vec();
        recent.sort_by_key(|r| r.ts);
        recent
    }

    /// 定期检查是否需要裁剪
    fn maybe_cleanup(&self) {
        let count = self.write_count.fetch_add(1, Ordering::Relaxed);
        if count % CLEANUP_CHECK_INTERVAL != 0 {
            return;
        }

        if let Ok(metadata) = fs::metadata(&self.path) {
            // 估算行数：平均每行 150 字节
            let estimated_lines = metadata.len() as usize / 150;
            if estimated_lines > MAX_ROWS {
                let _ = self.cleanup();
            }
        }
    }

    /// 执行裁剪（保留最近的行）
    fn cleanup(&self) -> Result<()> {
        use fs2::FileExt;

        let file = File::open(&self.path)?;
        file.lock_exclusive()?;

        let reader = BufReader::new(&file);
        let rows: Vec<HistoryRow> = reader
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        if rows.len() <= MAX_ROWS {
            file.unlock()?;
            return Ok(());
        }

        let start = rows.len().saturating_sub(KEEP_AFTER_CLEANUP);
        let to_keep = &rows[start..];

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = File::create(&temp_path)?;
            for row in to_keep {
                writeln!(temp_file, "{}", serde_json::to_string(row)?)?;
            }
        }

        // 原子替换
        fs::rename(&temp_path, &self.path)?;
        file.unlock()?;
        Ok(())
    }
}
