//! poolgate：AI 提供方连接池的准入控制。
//!
//! 历史用量（按桶聚合的窗口计数）+ 在途预留 → 策略判定 → 放行、延迟重试或死信。

pub mod allocation;
pub mod config;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod quota_pool;
pub mod runtime_config;
pub mod strategy;
