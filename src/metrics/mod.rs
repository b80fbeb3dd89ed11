//! 用量指标：窗口计数存储、聚合仓库与异步写入器。

mod recorder;
mod repository;
mod store;

pub use recorder::{DEFAULT_RECORDER_CAPACITY, UsageRecorder, UsageSample};
pub use repository::{DEFAULT_BUCKET_SECS, MetricsRepository, RepositorySettings};
pub use store::{BucketKey, BucketScope, MemoryMetricsStore, MetricsStore};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MetricsError {
    #[error("指标存储不可用: {0}")]
    StorageUnavailable(String),

    #[error("指标存储操作超时（{0:?}）")]
    Timeout(Duration),
}

impl MetricsError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }
}
