use crate::strategy::{
    GateInput, GateOutput, Limit, PrioritizationStrategy, RuleCheck, RuleScope, base_checks,
    decide,
};

/// 加权公平份额：在默认校验之外，每条池级规则按条目权重拆出份额，
/// 单个条目不能吃掉超过自身份额的池容量。
#[derive(Debug, Clone, Copy, Default)]
pub struct FairShareStrategy;

impl PrioritizationStrategy for FairShareStrategy {
    fn name(&self) -> &'static str {
        "fair_share"
    }

    fn gate(&self, input: &GateInput<'_>) -> GateOutput {
        let alloc = input.allocation_or_empty();
        let mut checks = base_checks(input, &alloc);

        let pool = input.pool;
        let rid = input.resource_id;
        if let Some(entry) = pool.entry(rid) {
            let total_weight = pool.total_weight().max(1);
            let weight = entry.weight.max(1) as u64;
            for rule in &pool.rules {
                // 向上取整，保证每个条目至少能分到 1。
                let share = (rule.max.saturating_mul(weight)).div_ceil(total_weight);
                let mut share_rule = *rule;
                share_rule.max = share;
                let used = input
                    .usage
                    .resource(rule.window_secs, rid)
                    .saturating_add(alloc.resource(rid))
                    .get(rule.metric);
                checks.push(RuleCheck {
                    scope: RuleScope::FairShare {
                        resource_id: rid.to_string(),
                    },
                    limit: Limit::Quota { rule: share_rule },
                    used,
                    cost: rule.cost(input.request_tokens),
                });
            }
        }

        decide(input, alloc, &checks)
    }
}
