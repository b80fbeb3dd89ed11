use crate::metrics::{DEFAULT_BUCKET_SECS, DEFAULT_RECORDER_CAPACITY, RepositorySettings};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::quota_pool::PoolDefinition;
use crate::runtime_config::{BackoffPolicy, FailPolicy};
use crate::strategy::{DEFAULT_NEAR_LIMIT_RATIO, StrategyKind};
use anyhow::Context;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "./poolgate.toml";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_METRICS_TIMEOUT_MS: u64 = 500;
const DEFAULT_METRICS_READ_ATTEMPTS: u32 = 3;
const DEFAULT_MAX_IN_FLIGHT_SECS: u64 = 300;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 15;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub debug: String,
    /// `LOG_FORMAT=json` 时输出结构化 JSON 日志。
    pub log_json: bool,

    pub bucket_secs: u64,
    pub metrics_retention_secs: u64,
    pub metrics_timeout_ms: u64,
    pub metrics_read_attempts: u32,
    pub fail_policy: FailPolicy,

    pub max_in_flight_secs: u64,
    pub sweep_interval_secs: u64,

    pub strategy: StrategyKind,
    pub near_limit_ratio: f64,

    pub backoff: BackoffPolicy,
    pub queue_capacity: usize,
    pub recorder_capacity: usize,

    pub data_dir: String,
    pub pools: Vec<PoolDefinition>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
    #[serde(alias = "LOG_FORMAT")]
    log_format: Option<String>,

    #[serde(alias = "BUCKET_SECONDS")]
    bucket_seconds: Option<u64>,
    #[serde(alias = "METRICS_RETENTION_SECONDS")]
    metrics_retention_seconds: Option<u64>,
    #[serde(alias = "METRICS_TIMEOUT_MS")]
    metrics_timeout_ms: Option<u64>,
    #[serde(alias = "METRICS_READ_ATTEMPTS")]
    metrics_read_attempts: Option<u32>,
    #[serde(alias = "METRICS_FAIL_POLICY")]
    metrics_fail_policy: Option<String>,

    #[serde(alias = "MAX_IN_FLIGHT_SECONDS")]
    max_in_flight_seconds: Option<u64>,
    #[serde(alias = "SWEEP_INTERVAL_SECONDS")]
    sweep_interval_seconds: Option<u64>,

    #[serde(alias = "STRATEGY")]
    strategy: Option<String>,
    #[serde(alias = "NEAR_LIMIT_RATIO")]
    near_limit_ratio: Option<f64>,

    #[serde(alias = "QUEUE_MAX_RETRIES")]
    queue_max_retries: Option<u32>,
    #[serde(alias = "QUEUE_BASE_DELAY_MS")]
    queue_base_delay_ms: Option<u64>,
    #[serde(alias = "QUEUE_MAX_DELAY_MS")]
    queue_max_delay_ms: Option<u64>,
    #[serde(alias = "QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,
    #[serde(alias = "RECORDER_CAPACITY")]
    recorder_capacity: Option<usize>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,

    /// 只从配置文件读取。
    #[serde(default)]
    pools: Vec<PoolDefinition>,
}

impl Config {
    /// 读取配置：TOML 文件（`POOLGATE_CONFIG`，默认 `./poolgate.toml`）之上叠加环境变量。
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("POOLGATE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let figment = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::raw().ignore(&["POOLS"]));
        let mut cfg =
            Self::from_figment(&figment).with_context(|| format!("解析配置失败: {path}"))?;

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if (arg == "-debug" || arg == "--debug")
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        Ok(cfg)
    }

    pub fn from_figment(figment: &Figment) -> anyhow::Result<Self> {
        let raw = figment.extract::<RawConfig>()?;
        let backoff_default = BackoffPolicy::default();

        let fail_policy = match raw.metrics_fail_policy.as_deref() {
            None => FailPolicy::default(),
            Some(v) => FailPolicy::parse(v).unwrap_or_else(|| {
                tracing::warn!("未知的 METRICS_FAIL_POLICY={v}，使用 closed");
                FailPolicy::default()
            }),
        };
        let strategy = match raw.strategy.as_deref() {
            None => StrategyKind::default(),
            Some(v) => StrategyKind::parse(v).unwrap_or_else(|| {
                tracing::warn!("未知的 STRATEGY={v}，使用 window");
                StrategyKind::default()
            }),
        };

        Ok(Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            debug: raw.debug.unwrap_or_else(|| "low".to_string()),
            log_json: raw
                .log_format
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("json")),
            bucket_secs: raw.bucket_seconds.unwrap_or(DEFAULT_BUCKET_SECS).max(1),
            metrics_retention_secs: raw
                .metrics_retention_seconds
                .unwrap_or(DEFAULT_RETENTION_SECS),
            metrics_timeout_ms: raw.metrics_timeout_ms.unwrap_or(DEFAULT_METRICS_TIMEOUT_MS),
            metrics_read_attempts: raw
                .metrics_read_attempts
                .unwrap_or(DEFAULT_METRICS_READ_ATTEMPTS),
            fail_policy,
            max_in_flight_secs: raw
                .max_in_flight_seconds
                .unwrap_or(DEFAULT_MAX_IN_FLIGHT_SECS),
            sweep_interval_secs: raw
                .sweep_interval_seconds
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            strategy,
            near_limit_ratio: raw.near_limit_ratio.unwrap_or(DEFAULT_NEAR_LIMIT_RATIO),
            backoff: BackoffPolicy {
                max_retries: raw.queue_max_retries.unwrap_or(backoff_default.max_retries),
                base_delay_ms: raw
                    .queue_base_delay_ms
                    .unwrap_or(backoff_default.base_delay_ms),
                max_delay_ms: raw
                    .queue_max_delay_ms
                    .unwrap_or(backoff_default.max_delay_ms),
            },
            queue_capacity: raw.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            recorder_capacity: raw.recorder_capacity.unwrap_or(DEFAULT_RECORDER_CAPACITY),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
            pools: raw.pools,
        })
    }

    pub fn repository_settings(&self) -> RepositorySettings {
        RepositorySettings {
            bucket_secs: self.bucket_secs,
            op_timeout: Duration::from_millis(self.metrics_timeout_ms),
            read_attempts: self.metrics_read_attempts,
        }
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota_pool::MetricKind;

    #[test]
    fn empty_source_falls_back_to_defaults() {
        let cfg = Config::from_figment(&Figment::new()).unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.bucket_secs, 60);
        assert!(!cfg.log_json);
        assert_eq!(cfg.fail_policy, FailPolicy::Closed);
        assert_eq!(cfg.strategy, StrategyKind::Window);
        assert_eq!(cfg.backoff, BackoffPolicy::default());
        assert!(cfg.pools.is_empty());
    }

    #[test]
    fn toml_pools_and_tunables_are_read() {
        let toml = r#"
            port = 9000
            metrics_fail_policy = "open"
            strategy = "fair_share"
            queue_max_retries = 7

            [[pools]]
            id = "gpt"
            name = "GPT-4o"
            rules = [
                { metric = "requests", window_secs = 60, max = 100 },
                { metric = "tokens", window_secs = 60, max = 50000 },
            ]

            [[pools.entries]]
            resource_id = "east"
            connection = { id = "conn-east", provider = "azure", max_concurrency = 8 }
            weight = 2

            [[pools.entries]]
            resource_id = "west"
            connection = { id = "conn-west" }
            rules = [{ metric = "requests", window_secs = 60, max = 20 }]
        "#;
        let cfg = Config::from_figment(&Figment::from(Toml::string(toml))).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.fail_policy, FailPolicy::Open);
        assert_eq!(cfg.strategy, StrategyKind::FairShare);
        assert_eq!(cfg.backoff.max_retries, 7);
        assert_eq!(cfg.backoff.base_delay_ms, 500);

        let pool = &cfg.pools[0];
        assert_eq!(pool.rules[1].metric, MetricKind::Tokens);
        assert_eq!(pool.entries[0].connection.max_concurrency, Some(8));
        assert_eq!(pool.entries[0].weight, 2);
        assert_eq!(pool.entries[1].weight, 1);
        assert_eq!(pool.entries[1].rules[0].max, 20);
    }
}
