//! 运行时可动态修改的配置。
//!
//! 用于支持 `/settings` 接口“立即生效”的需求。
//! 使用 ArcSwap 实现无锁读取，写入时创建新的配置快照。

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::logging::LogLevel;

/// 指标读取失败时的处理方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// 拒绝并入队重试（硬限额更安全）。
    #[default]
    Closed,
    /// 视历史用量为 0，仅凭预留判定（软限额尽力而为）。
    Open,
}

impl FailPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "closed" | "fail-closed" | "fail_closed" => Some(Self::Closed),
            "open" | "fail-open" | "fail_open" => Some(Self::Open),
            _ => None,
        }
    }
}

/// 队列重试退避：`base * 2^retry`，不超过 `max_delay_ms`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// 运行时配置快照。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSettings {
    /// 决策日志级别
    pub debug: String,
    pub fail_policy: FailPolicy,
    pub near_limit_ratio: f64,
    pub backoff: BackoffPolicy,
    /// 预留最长在途时长（秒），超过后被清扫强制释放
    pub max_in_flight_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            debug: "low".to_string(),
            fail_policy: FailPolicy::Closed,
            near_limit_ratio: crate::strategy::DEFAULT_NEAR_LIMIT_RATIO,
            backoff: BackoffPolicy::default(),
            max_in_flight_secs: 300,
        }
    }
}

impl RuntimeSettings {
    /// 从初始 Config 创建运行时配置。
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            debug: normalize_debug(&cfg.debug),
            fail_policy: cfg.fail_policy,
            near_limit_ratio: cfg.near_limit_ratio,
            backoff: cfg.backoff,
            max_in_flight_secs: cfg.max_in_flight_secs,
        }
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }

    pub fn max_in_flight(&self) -> Duration {
        Duration::from_secs(self.max_in_flight_secs)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        let debug = self.debug.trim().to_lowercase();
        if !matches!(debug.as_str(), "" | "off" | "low" | "medium" | "high") {
            return Err("日志级别必须是 off、low、medium 或 high");
        }
        if !(self.near_limit_ratio.is_finite()
            && self.near_limit_ratio > 0.0
            && self.near_limit_ratio <= 1.0)
        {
            return Err("near_limit_ratio 必须在 (0, 1] 之间");
        }
        if self.backoff.max_retries == 0 {
            return Err("max_retries 至少为 1");
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err("base_delay_ms 不能大于 max_delay_ms");
        }
        if self.max_in_flight_secs == 0 {
            return Err("max_in_flight_secs 必须大于 0");
        }
        Ok(())
    }
}

/// `/settings` 提交的局部更新，缺省字段保持原值。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub debug: Option<String>,
    #[serde(default)]
    pub fail_policy: Option<FailPolicy>,
    #[serde(default)]
    pub near_limit_ratio: Option<f64>,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default)]
    pub max_in_flight_secs: Option<u64>,
}

impl SettingsUpdate {
    pub fn apply_to(&self, current: &RuntimeSettings) -> RuntimeSettings {
        RuntimeSettings {
            debug: self
                .debug
                .as_deref()
                .map(normalize_debug)
                .unwrap_or_else(|| current.debug.clone()),
            fail_policy: self.fail_policy.unwrap_or(current.fail_policy),
            near_limit_ratio: self.near_limit_ratio.unwrap_or(current.near_limit_ratio),
            backoff: self.backoff.unwrap_or(current.backoff),
            max_in_flight_secs: self.max_in_flight_secs.unwrap_or(current.max_in_flight_secs),
        }
    }
}

/// 共享的运行时配置句柄；编排器、清扫任务与 HTTP 接口持有同一份。
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<ArcSwap<RuntimeSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// 获取当前运行时配置快照。
    pub fn get(&self) -> Arc<RuntimeSettings> {
        self.inner.load_full()
    }

    /// 校验通过后替换快照。
    pub fn update(&self, next: RuntimeSettings) -> Result<(), &'static str> {
        next.validate()?;
        self.inner.store(Arc::new(next));
        Ok(())
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(RuntimeSettings::default())
    }
}

fn normalize_debug(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "low" => "low",
        "medium" => "medium",
        "high" => "high",
        _ => "off",
    }
    .to_string()
}
