//! 准入策略：把历史用量 + 在途预留转换成放行/拒绝结论。
//!
//! 策略只有一个能力 `gate`，由配置选择具体实现，注入到 GateOrchestrator。

mod fair_share;
mod usage;
mod window;

pub use fair_share::FairShareStrategy;
pub use usage::{UsageSnapshot, WindowUsage};
pub use window::WindowQuotaStrategy;

use crate::allocation::PoolWorkloadAllocation;
use crate::quota_pool::{AIConnection, PoolDefinition, QuotaRule, Usage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_NEAR_LIMIT_RATIO: f64 = 0.9;

/// 一次判定的完整输入。
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub pool: &'a PoolDefinition,
    pub request_time: DateTime<Utc>,
    pub request_tokens: u64,
    pub resource_id: &'a str,
    pub connection: &'a AIConnection,
    pub usage: &'a UsageSnapshot,
    pub allocation: Option<&'a PoolWorkloadAllocation>,
    /// 放行后占用比例达到该值时在 reason 中提示“接近上限”。
    pub near_limit_ratio: f64,
}

impl GateInput<'_> {
    pub fn allocation_or_empty(&self) -> PoolWorkloadAllocation {
        self.allocation
            .cloned()
            .unwrap_or_else(|| PoolWorkloadAllocation::new(&self.pool.id))
    }

    pub fn cost(&self) -> Usage {
        Usage::new(1, self.request_tokens)
    }
}

pub trait PrioritizationStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn gate(&self, input: &GateInput<'_>) -> GateOutput;
}

/// 规则作用范围。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleScope {
    Pool { pool_id: String },
    Entry { resource_id: String },
    FairShare { resource_id: String },
    Connection { connection_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Limit {
    Quota { rule: QuotaRule },
    Concurrency { max: u64 },
}

impl Limit {
    pub fn max(&self) -> u64 {
        match self {
            Self::Quota { rule } => rule.max,
            Self::Concurrency { max } => *max,
        }
    }
}

/// 单条规则在本次请求下的核算：已用（历史 + 预留）、本次成本与上限。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleCheck {
    pub scope: RuleScope,
    pub limit: Limit,
    pub used: u64,
    pub cost: u64,
}

impl RuleCheck {
    pub fn exceeded(&self) -> bool {
        self.used.saturating_add(self.cost) > self.limit.max()
    }

    /// 单次成本就超过上限：无论等多久都不可能放行。
    pub fn unsatisfiable(&self) -> bool {
        self.cost > self.limit.max()
    }

    fn fill_ratio_after(&self) -> f64 {
        let max = self.limit.max();
        if max == 0 {
            return 1.0;
        }
        self.used.saturating_add(self.cost) as f64 / max as f64
    }

    fn label(&self) -> String {
        let scope = match &self.scope {
            RuleScope::Pool { pool_id } => format!("pool `{pool_id}`"),
            RuleScope::Entry { resource_id } => format!("entry `{resource_id}`"),
            RuleScope::FairShare { resource_id } => format!("fair share of `{resource_id}`"),
            RuleScope::Connection { connection_id } => format!("connection `{connection_id}`"),
        };
        match self.limit {
            Limit::Quota { rule } => format!("{scope} {rule}"),
            Limit::Concurrency { .. } => format!("{scope} concurrency"),
        }
    }
}

impl fmt::Display for RuleCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exceeded: {}/{}",
            self.label(),
            self.used,
            self.limit.max()
        )
    }
}

/// 判定结论。拒绝时 reason 必填，指出被突破的规则。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateOutput {
    pub allowed: bool,
    pub allocation: PoolWorkloadAllocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation: Option<RuleCheck>,
}

impl GateOutput {
    pub fn admit(allocation: PoolWorkloadAllocation, reason: Option<String>) -> Self {
        Self {
            allowed: true,
            allocation,
            reason,
            violation: None,
        }
    }

    pub fn deny(allocation: PoolWorkloadAllocation, violation: RuleCheck) -> Self {
        Self {
            allowed: false,
            allocation,
            reason: Some(violation.to_string()),
            violation: Some(violation),
        }
    }

    /// 非规则原因的拒绝（例如指标存储不可用且策略为 fail-closed）。
    pub fn deny_with_reason(allocation: PoolWorkloadAllocation, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            allocation,
            reason: Some(reason.into()),
            violation: None,
        }
    }

    pub fn unsatisfiable(&self) -> bool {
        self.violation.as_ref().is_some_and(RuleCheck::unsatisfiable)
    }
}

/// 池级规则与条目级规则的公共核算。顺序：池级、条目级、连接并发。
pub(crate) fn base_checks(input: &GateInput<'_>, alloc: &PoolWorkloadAllocation) -> Vec<RuleCheck> {
    let pool = input.pool;
    let rid = input.resource_id;
    let mut checks = Vec::new();

    for rule in &pool.rules {
        let used = input
            .usage
            .pool(rule.window_secs)
            .saturating_add(alloc.total)
            .get(rule.metric);
        checks.push(RuleCheck {
            scope: RuleScope::Pool {
                pool_id: pool.id.clone(),
            },
            limit: Limit::Quota { rule: *rule },
            used,
            cost: rule.cost(input.request_tokens),
        });
    }

    if let Some(entry) = pool.entry(rid) {
        for rule in &entry.rules {
            let used = input
                .usage
                .resource(rule.window_secs, rid)
                .saturating_add(alloc.resource(rid))
                .get(rule.metric);
            checks.push(RuleCheck {
                scope: RuleScope::Entry {
                    resource_id: rid.to_string(),
                },
                limit: Limit::Quota { rule: *rule },
                used,
                cost: rule.cost(input.request_tokens),
            });
        }
    }

    if let Some(max) = input.connection.max_concurrency {
        checks.push(RuleCheck {
            scope: RuleScope::Connection {
                connection_id: input.connection.id.clone(),
            },
            limit: Limit::Concurrency { max },
            used: alloc.resource(rid).requests,
            cost: 1,
        });
    }

    checks
}

/// 最严格者胜出：任一规则被突破即拒绝（报告第一条）；否则叠加预留放行。
pub(crate) fn decide(
    input: &GateInput<'_>,
    alloc: PoolWorkloadAllocation,
    checks: &[RuleCheck],
) -> GateOutput {
    if let Some(violated) = checks.iter().find(|c| c.exceeded()) {
        return GateOutput::deny(alloc, violated.clone());
    }

    let near = checks
        .iter()
        .map(|c| (c, c.fill_ratio_after()))
        .filter(|(_, ratio)| *ratio >= input.near_limit_ratio)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(c, _)| {
            format!(
                "near limit: {} {}/{}",
                c.label(),
                c.used.saturating_add(c.cost),
                c.limit.max()
            )
        });

    let next = alloc.with_reserved(input.resource_id, input.cost());
    GateOutput::admit(next, near)
}

/// 可通过配置选择的策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Window,
    FairShare,
}

impl StrategyKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "window" => Some(Self::Window),
            "fair_share" | "fair-share" | "fairshare" => Some(Self::FairShare),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn PrioritizationStrategy> {
        match self {
            Self::Window => Arc::new(WindowQuotaStrategy),
            Self::FairShare => Arc::new(FairShareStrategy),
        }
    }
}
