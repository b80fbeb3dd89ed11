use crate::strategy::{GateInput, GateOutput, PrioritizationStrategy, base_checks, decide};

/// 默认策略：池级、条目级窗口配额与连接并发上限同时校验，任一突破即拒绝。
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowQuotaStrategy;

impl PrioritizationStrategy for WindowQuotaStrategy {
    fn name(&self) -> &'static str {
        "window"
    }

    fn gate(&self, input: &GateInput<'_>) -> GateOutput {
        let alloc = input.allocation_or_empty();
        let checks = base_checks(input, &alloc);
        decide(input, alloc, &checks)
    }
}
