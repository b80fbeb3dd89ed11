//! 用量异步写入：请求路径只投递到有界队列，由后台任务写入仓库。
//!
//! 队列满或写入失败只记录告警并丢弃（少计用量换取可用性）。
//! 样本携带的预留在写入结束后才释放，写入前的这段时间仍由预留占住容量。

use crate::allocation::{AllocationTracker, InFlight};
use crate::metrics::MetricsRepository;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub const DEFAULT_RECORDER_CAPACITY: usize = 4096;

/// 一条待写入的用量事实。
#[derive(Debug, Clone)]
pub struct UsageSample {
    pub request_time: DateTime<Utc>,
    pub pool_id: String,
    pub connection_id: String,
    pub tokens: u64,
    /// 已摘下的在途记录，写入结束后释放。
    pub reservation: Option<InFlight>,
}

#[derive(Debug, Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageSample>,
    tracker: Arc<AllocationTracker>,
}

impl UsageRecorder {
    /// 创建写入器并启动后台写入任务。
    pub fn spawn(
        repo: Arc<MetricsRepository>,
        tracker: Arc<AllocationTracker>,
        capacity: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<UsageSample>(capacity.max(1));
        let worker_tracker = tracker.clone();
        tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                if let Err(e) = repo
                    .write(
                        sample.request_time,
                        sample.tokens,
                        &sample.connection_id,
                        &sample.pool_id,
                    )
                    .await
                {
                    tracing::warn!(
                        pool_id = %sample.pool_id,
                        connection_id = %sample.connection_id,
                        tokens = sample.tokens,
                        error = %e,
                        "写入用量失败，已丢弃"
                    );
                }
                if let Some(record) = &sample.reservation {
                    worker_tracker.release_claimed(record);
                }
            }
            tracing::debug!("用量写入任务退出");
        });
        Self { tx, tracker }
    }

    /// 投递一条用量，不等待写入结果。
    pub fn record(&self, sample: UsageSample) {
        match self.tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(s)) => {
                tracing::warn!(pool_id = %s.pool_id, "用量写入队列已满，丢弃本次用量");
                self.release(&s);
            }
            Err(TrySendError::Closed(s)) => {
                tracing::warn!(pool_id = %s.pool_id, "用量写入任务已停止，丢弃本次用量");
                self.release(&s);
            }
        }
    }

    fn release(&self, sample: &UsageSample) {
        if let Some(record) = &sample.reservation {
            self.tracker.release_claimed(record);
        }
    }
}
