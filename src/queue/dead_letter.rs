//! 死信：重试耗尽的 item 不会被静默丢弃。
//!
//! 最近的记录留在内存中供 `/stats` 查询，同时追加写入 `dead_letter.jsonl`。

use crate::queue::types::DeadLetter;
use anyhow::Context;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const DEFAULT_RECENT_CAPACITY: usize = 256;
const JOURNAL_FILE: &str = "dead_letter.jsonl";

#[derive(Debug)]
pub struct DeadLetterQueue {
    recent: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
    total: AtomicU64,
    journal: Option<PathBuf>,
}

impl DeadLetterQueue {
    /// 仅内存保留，不落盘。
    pub fn in_memory() -> Self {
        Self {
            recent: Mutex::new(VecDeque::new()),
            capacity: DEFAULT_RECENT_CAPACITY,
            total: AtomicU64::new(0),
            journal: None,
        }
    }

    pub fn with_journal(data_dir: &str) -> Self {
        Self {
            journal: Some(PathBuf::from(data_dir).join(JOURNAL_FILE)),
            ..Self::in_memory()
        }
    }

    pub async fn push(&self, letter: DeadLetter) {
        crate::logging::dead_lettered(&letter);
        self.total.fetch_add(1, Ordering::Relaxed);

        if let Some(path) = &self.journal
            && let Err(e) = append_journal(path, &letter).await
        {
            tracing::warn!("写入死信日志失败: {e:#}");
        }

        let mut recent = self.recent.lock().await;
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(letter);
    }

    /// 最近的死信，按时间先后排列。
    pub async fn recent(&self) -> Vec<DeadLetter> {
        self.recent.lock().await.iter().cloned().collect()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

async fn append_journal(path: &Path, letter: &DeadLetter) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("创建数据目录失败")?;
    }
    let mut line = sonic_rs::to_vec(letter).context("序列化死信失败")?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("打开死信日志失败: {path:?}"))?;
    file.write_all(&line).await?;
    Ok(())
}
