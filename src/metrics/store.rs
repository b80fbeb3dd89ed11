use crate::metrics::MetricsError;
use crate::quota_pool::Usage;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_MAX_BUCKETS: u64 = 1_000_000;

/// 桶的统计粒度：池级汇总或单个连接。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketScope {
    Pool,
    Connection(String),
}

/// 一个时间桶的寻址键；`bucket_start` 为按粒度截断后的 unix 秒。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub pool_id: String,
    pub scope: BucketScope,
    pub bucket_start: i64,
}

impl BucketKey {
    pub fn pool(pool_id: &str, bucket_start: i64) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            scope: BucketScope::Pool,
            bucket_start,
        }
    }

    pub fn connection(pool_id: &str, connection_id: &str, bucket_start: i64) -> Self {
        Self {
            pool_id: pool_id.to_string(),
            scope: BucketScope::Connection(connection_id.to_string()),
            bucket_start,
        }
    }
}

/// 窗口计数存储边界：按桶递增写入、按键批量读取。
///
/// 任何能满足“只增不改”与批量读取的时序存储都可以替换进来。
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// 对桶做加法递增；并发写同一个桶必须可交换。
    async fn increment(&self, key: &BucketKey, delta: Usage) -> Result<(), MetricsError>;

    /// 读取各桶当前计数；不存在的桶返回零值，结果与 keys 一一对应。
    async fn read(&self, keys: &[BucketKey]) -> Result<Vec<Usage>, MetricsError>;
}

#[derive(Debug, Default)]
struct BucketCounter {
    requests: AtomicU64,
    tokens: AtomicU64,
}

impl BucketCounter {
    fn add(&self, delta: Usage) {
        self.requests.fetch_add(delta.requests, Ordering::Relaxed);
        self.tokens.fetch_add(delta.tokens, Ordering::Relaxed);
    }

    fn load(&self) -> Usage {
        Usage {
            requests: self.requests.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
        }
    }
}

/// 进程内存储：moka 缓存 + 原子计数器，桶在保留期后自动过期。
#[derive(Clone)]
pub struct MemoryMetricsStore {
    buckets: Cache<BucketKey, Arc<BucketCounter>>,
}

impl MemoryMetricsStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            buckets: Cache::builder()
                .max_capacity(DEFAULT_MAX_BUCKETS)
                .time_to_live(retention)
                .build(),
        }
    }
}

impl std::fmt::Debug for MemoryMetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMetricsStore")
            .field("buckets", &self.buckets.entry_count())
            .finish()
    }
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn increment(&self, key: &BucketKey, delta: Usage) -> Result<(), MetricsError> {
        // get_with 保证同一个键只初始化一次，随后的加法在原子计数器上完成。
        let counter = self
            .buckets
            .get_with(key.clone(), async { Arc::new(BucketCounter::default()) })
            .await;
        counter.add(delta);
        Ok(())
    }

    async fn read(&self, keys: &[BucketKey]) -> Result<Vec<Usage>, MetricsError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let usage = match self.buckets.get(key).await {
                Some(counter) => counter.load(),
                None => Usage::default(),
            };
            out.push(usage);
        }
        Ok(out)
    }
}
