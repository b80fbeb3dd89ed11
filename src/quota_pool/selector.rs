//! 条目选择：Power of Two Choices（随机抽两个，取余量更大者）。
//!
//! 调用方未指定 resourceId 时使用；只负责挑选，最终是否放行仍由策略判定。

use std::cell::Cell;
use std::collections::HashSet;

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    let u = uuid::Uuid::new_v4().as_u128();
    let s = (u as u64) ^ ((u >> 64) as u64);
    // xorshift 零种子会退化为常数序列。
    if s == 0 { 0x9E37_79B9_7F4A_7C15 } else { s }
}

fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

fn random_index(upper: usize) -> usize {
    if upper <= 1 {
        return 0;
    }
    (next_u64() as usize) % upper
}

/// 一个候选条目及其剩余余量比例（[0, 1]，越大越空闲）。
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub resource_id: &'a str,
    pub headroom: f64,
}

fn headroom_or_zero(c: &Candidate<'_>) -> f64 {
    if c.headroom.is_finite() {
        c.headroom.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// 从候选中选出一个条目，跳过 exclude 中的 resourceId。
pub fn select_entry_excluding(
    candidates: &[Candidate<'_>],
    exclude: &HashSet<String>,
) -> Option<String> {
    let eligible: Vec<&Candidate<'_>> = candidates
        .iter()
        .filter(|c| !exclude.contains(c.resource_id))
        .collect();

    match eligible.len() {
        0 => None,
        1 => Some(eligible[0].resource_id.to_string()),
        n => {
            let i1 = random_index(n);
            let j = random_index(n - 1);
            let i2 = if j >= i1 { j + 1 } else { j };
            let (a, b) = (eligible[i1], eligible[i2]);
            let picked = if headroom_or_zero(a) >= headroom_or_zero(b) {
                a
            } else {
                b
            };
            Some(picked.resource_id.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_skips_excluded_and_handles_single() {
        let cands = [
            Candidate {
                resource_id: "a",
                headroom: 0.2,
            },
            Candidate {
                resource_id: "b",
                headroom: 0.9,
            },
        ];
        let mut exclude = HashSet::new();
        exclude.insert("b".to_string());
        assert_eq!(
            select_entry_excluding(&cands, &exclude),
            Some("a".to_string())
        );
        exclude.insert("a".to_string());
        assert_eq!(select_entry_excluding(&cands, &exclude), None);
    }

    #[test]
    fn two_candidates_always_pick_larger_headroom() {
        // NaN 视为 0，不应压过有效余量。
        let cands = [
            Candidate {
                resource_id: "valid",
                headroom: 0.1,
            },
            Candidate {
                resource_id: "nan",
                headroom: f64::NAN,
            },
        ];
        for _ in 0..32 {
            assert_eq!(
                select_entry_excluding(&cands, &HashSet::new()),
                Some("valid".to_string())
            );
        }
    }
}
