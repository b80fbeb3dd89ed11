//! 指标仓库：唯一与 MetricsStore 交互的组件，把桶聚合成任意窗口。
//!
//! 窗口 `[anchor - window, anchor]` 覆盖到的桶全部计入（不做桶内插值），
//! 因此结果最多高估一个桶宽度的用量。

use crate::metrics::{BucketKey, MetricsError, MetricsStore};
use crate::quota_pool::{PoolDefinition, Usage};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BUCKET_SECS: u64 = 60;
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_READ_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct RepositorySettings {
    /// 桶粒度（秒）。
    pub bucket_secs: u64,
    /// 单次存储读写的超时。
    pub op_timeout: Duration,
    /// 读取失败时的总尝试次数（含首次）。
    pub read_attempts: u32,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,
            op_timeout: DEFAULT_OP_TIMEOUT,
            read_attempts: DEFAULT_READ_ATTEMPTS,
        }
    }
}

pub struct MetricsRepository {
    store: Arc<dyn MetricsStore>,
    settings: RepositorySettings,
}

impl std::fmt::Debug for MetricsRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRepository")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MetricsRepository {
    pub fn new(store: Arc<dyn MetricsStore>, mut settings: RepositorySettings) -> Self {
        settings.bucket_secs = settings.bucket_secs.max(1);
        settings.read_attempts = settings.read_attempts.max(1);
        Self { store, settings }
    }

    pub fn bucket_secs(&self) -> u64 {
        self.settings.bucket_secs
    }

    /// 把时间截断到所在桶的起点（unix 秒）。
    pub fn bucket_start(&self, t: DateTime<Utc>) -> i64 {
        let width = self.settings.bucket_secs as i64;
        t.timestamp().div_euclid(width) * width
    }

    /// 与窗口 `[anchor - window_secs, anchor]` 重叠的全部桶起点，按时间升序。
    pub fn window_buckets(&self, anchor: DateTime<Utc>, window_secs: u64) -> Vec<i64> {
        let width = self.settings.bucket_secs as i64;
        let last = self.bucket_start(anchor);
        let first = (anchor.timestamp() - window_secs as i64).div_euclid(width) * width;
        (first..=last).step_by(width as usize).collect()
    }

    /// 记录一次用量：池桶与连接桶各 +1 请求、+request_tokens token。
    ///
    /// 先写池桶，池级规则读它；连接桶写失败时池桶已计入，只影响条目粒度。
    /// 写入不重试（超时后可能已生效，重试会重复计数），失败由调用方记录日志。
    pub async fn write(
        &self,
        request_time: DateTime<Utc>,
        request_tokens: u64,
        connection_id: &str,
        pool_id: &str,
    ) -> Result<(), MetricsError> {
        let bucket = self.bucket_start(request_time);
        let delta = Usage::new(1, request_tokens);

        self.increment(&BucketKey::pool(pool_id, bucket), delta)
            .await?;
        if let Err(e) = self
            .increment(&BucketKey::connection(pool_id, connection_id, bucket), delta)
            .await
        {
            tracing::warn!(
                pool_id,
                connection_id,
                error = %e,
                "池桶已写入，连接桶写入失败"
            );
            return Err(e);
        }
        Ok(())
    }

    /// 单个桶、连接粒度的用量。
    pub async fn get_minute_metric(
        &self,
        request_time: DateTime<Utc>,
        connection_id: &str,
        pool_id: &str,
    ) -> Result<Usage, MetricsError> {
        let key = BucketKey::connection(pool_id, connection_id, self.bucket_start(request_time));
        self.read_sum(&[key]).await
    }

    /// 单个桶、池粒度的用量（池内所有连接之和）。
    pub async fn get_minute_metric_by_pool(
        &self,
        request_time: DateTime<Utc>,
        pool_id: &str,
    ) -> Result<Usage, MetricsError> {
        let key = BucketKey::pool(pool_id, self.bucket_start(request_time));
        self.read_sum(&[key]).await
    }

    /// 以 request_time 结尾、长 window_secs 秒的窗口内，连接粒度用量。
    pub async fn get_metric_by_window(
        &self,
        request_time: DateTime<Utc>,
        connection_id: &str,
        window_secs: u64,
        pool_id: &str,
    ) -> Result<Usage, MetricsError> {
        let keys: Vec<BucketKey> = self
            .window_buckets(request_time, window_secs)
            .into_iter()
            .map(|b| BucketKey::connection(pool_id, connection_id, b))
            .collect();
        self.read_sum(&keys).await
    }

    /// 窗口内池粒度用量；每次 write 都同步递增池桶，因此等于池内全部条目之和。
    pub async fn get_pool_metric_by_window(
        &self,
        request_time: DateTime<Utc>,
        window_secs: u64,
        pool_id: &str,
    ) -> Result<Usage, MetricsError> {
        let keys: Vec<BucketKey> = self
            .window_buckets(request_time, window_secs)
            .into_iter()
            .map(|b| BucketKey::pool(pool_id, b))
            .collect();
        self.read_sum(&keys).await
    }

    /// 窗口内按条目拆分的用量：resourceId -> 该条目连接的聚合用量。
    pub async fn get_resource_metric_by_window(
        &self,
        request_time: DateTime<Utc>,
        window_secs: u64,
        pool: &PoolDefinition,
    ) -> Result<HashMap<String, Usage>, MetricsError> {
        let buckets = self.window_buckets(request_time, window_secs);
        let mut keys = Vec::with_capacity(buckets.len() * pool.entries.len());
        for entry in &pool.entries {
            for b in &buckets {
                keys.push(BucketKey::connection(&pool.id, &entry.connection.id, *b));
            }
        }

        let values = self.read_with_retry(&keys).await?;
        let mut out = HashMap::with_capacity(pool.entries.len());
        if buckets.is_empty() {
            return Ok(out);
        }
        for (entry, chunk) in pool.entries.iter().zip(values.chunks(buckets.len())) {
            out.insert(entry.resource_id.clone(), chunk.iter().copied().sum());
        }
        Ok(out)
    }

    async fn increment(&self, key: &BucketKey, delta: Usage) -> Result<(), MetricsError> {
        match tokio::time::timeout(self.settings.op_timeout, self.store.increment(key, delta)).await
        {
            Ok(res) => res,
            Err(_) => Err(MetricsError::Timeout(self.settings.op_timeout)),
        }
    }

    async fn read_sum(&self, keys: &[BucketKey]) -> Result<Usage, MetricsError> {
        Ok(self.read_with_retry(keys).await?.into_iter().sum())
    }

    /// 带超时与有限次退避重试的批量读取。
    async fn read_with_retry(&self, keys: &[BucketKey]) -> Result<Vec<Usage>, MetricsError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut last_err = MetricsError::unavailable("未尝试读取");
        for attempt in 0..self.settings.read_attempts {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1)).await;
            }
            match tokio::time::timeout(self.settings.op_timeout, self.store.read(keys)).await {
                Ok(Ok(values)) if values.len() == keys.len() => return Ok(values),
                Ok(Ok(values)) => {
                    last_err = MetricsError::unavailable(format!(
                        "返回桶数量不匹配：期望 {}，实际 {}",
                        keys.len(),
                        values.len()
                    ));
                }
                Ok(Err(e)) => last_err = e,
                Err(_) => last_err = MetricsError::Timeout(self.settings.op_timeout),
            }
            tracing::debug!(attempt, error = %last_err, "读取指标失败");
        }
        Err(last_err)
    }
}
