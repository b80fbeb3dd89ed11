use crate::metrics::{MetricsError, MetricsRepository};
use crate::quota_pool::{PoolDefinition, Usage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// 单个窗口长度下的历史用量：池总量与按条目拆分。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowUsage {
    pub pool: Usage,
    pub by_resource: BTreeMap<String, Usage>,
}

/// 一次判定所需的全部历史用量，按窗口长度（秒）索引。
///
/// 判定前一次性读好，策略本身不做 I/O，保证同样的输入得到同样的结论。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub windows: BTreeMap<u64, WindowUsage>,
}

impl UsageSnapshot {
    pub fn pool(&self, window_secs: u64) -> Usage {
        self.windows
            .get(&window_secs)
            .map(|w| w.pool)
            .unwrap_or_default()
    }

    pub fn resource(&self, window_secs: u64, resource_id: &str) -> Usage {
        self.windows
            .get(&window_secs)
            .and_then(|w| w.by_resource.get(resource_id).copied())
            .unwrap_or_default()
    }

    pub fn with_pool(mut self, window_secs: u64, usage: Usage) -> Self {
        self.windows.entry(window_secs).or_default().pool = usage;
        self
    }

    pub fn with_resource(mut self, window_secs: u64, resource_id: &str, usage: Usage) -> Self {
        self.windows
            .entry(window_secs)
            .or_default()
            .by_resource
            .insert(resource_id.to_string(), usage);
        self
    }

    /// 从仓库读取池定义涉及的每个窗口；各窗口并发查询。
    pub async fn collect(
        repo: &MetricsRepository,
        pool: &PoolDefinition,
        request_time: DateTime<Utc>,
    ) -> Result<Self, MetricsError> {
        let reads = pool.windows().into_iter().map(|window| async move {
            let total = repo
                .get_pool_metric_by_window(request_time, window, &pool.id)
                .await?;
            let by_resource = if pool.entries.is_empty() {
                BTreeMap::new()
            } else {
                repo.get_resource_metric_by_window(request_time, window, pool)
                    .await?
                    .into_iter()
                    .collect()
            };
            Ok::<_, MetricsError>((
                window,
                WindowUsage {
                    pool: total,
                    by_resource,
                },
            ))
        });

        let windows = futures::future::try_join_all(reads).await?;
        Ok(Self {
            windows: windows.into_iter().collect(),
        })
    }
}
