use serde::{Deserialize, Serialize};
use std::fmt;

/// 配额规则统计的指标类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Requests,
    Tokens,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
        }
    }
}

/// 一条配额规则：在 `window_secs` 秒的滑动窗口内，`metric` 不得超过 `max`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuotaRule {
    pub metric: MetricKind,
    pub window_secs: u64,
    pub max: u64,
}

impl QuotaRule {
    pub fn requests(max: u64, window_secs: u64) -> Self {
        Self {
            metric: MetricKind::Requests,
            window_secs,
            max,
        }
    }

    pub fn tokens(max: u64, window_secs: u64) -> Self {
        Self {
            metric: MetricKind::Tokens,
            window_secs,
            max,
        }
    }

    /// 一次请求在该规则下的成本：请求数恒为 1，token 数为请求预估值。
    pub fn cost(&self, request_tokens: u64) -> u64 {
        match self.metric {
            MetricKind::Requests => 1,
            MetricKind::Tokens => request_tokens,
        }
    }
}

impl fmt::Display for QuotaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.metric.as_str(), self.window_secs)
    }
}

/// 后端连接引用。核心只读取 id 与静态并发上限。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AIConnection {
    pub id: String,
    #[serde(default)]
    pub provider: String,
    /// 同时在途（已预留未完成）请求数上限。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u64>,
}

/// 池内一个可寻址份额（通常对应一个连接）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefinitionEntry {
    pub resource_id: String,
    pub connection: AIConnection,
    /// 条目级规则，与池级规则同时生效（取最严格者）。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<QuotaRule>,
    /// fair_share 策略下的权重。
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// 逻辑容量分组：若干后端连接共享的一组配额。决策期间只读。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<QuotaRule>,
    #[serde(default)]
    pub entries: Vec<PoolDefinitionEntry>,
}

impl PoolDefinition {
    pub fn entry(&self, resource_id: &str) -> Option<&PoolDefinitionEntry> {
        self.entries.iter().find(|e| e.resource_id == resource_id)
    }

    pub fn total_weight(&self) -> u64 {
        self.entries.iter().map(|e| e.weight.max(1) as u64).sum()
    }

    /// 池级与条目级规则涉及的全部窗口长度（去重、升序）。
    pub fn windows(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self
            .rules
            .iter()
            .chain(self.entries.iter().flat_map(|e| e.rules.iter()))
            .map(|r| r.window_secs)
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// 一段时间内聚合后的用量。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub requests: u64,
    pub tokens: u64,
}

impl Usage {
    pub fn new(requests: u64, tokens: u64) -> Self {
        Self { requests, tokens }
    }

    pub fn get(&self, metric: MetricKind) -> u64 {
        match metric {
            MetricKind::Requests => self.requests,
            MetricKind::Tokens => self.tokens,
        }
    }

    pub fn saturating_add(self, other: Usage) -> Usage {
        Usage {
            requests: self.requests.saturating_add(other.requests),
            tokens: self.tokens.saturating_add(other.tokens),
        }
    }

    pub fn saturating_sub(self, other: Usage) -> Usage {
        Usage {
            requests: self.requests.saturating_sub(other.requests),
            tokens: self.tokens.saturating_sub(other.tokens),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.requests == 0 && self.tokens == 0
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Self {
        iter.fold(Usage::default(), Usage::saturating_add)
    }
}
