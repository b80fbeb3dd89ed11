use crate::allocation::{LeakedReservation, ReservationTicket};
use crate::queue::{DeadLetter, QueueItem};
use crate::strategy::GateOutput;

/// 决策日志等级：
/// - off：不输出决策日志（异常仍走 warn/error）
/// - low：输出拒绝、死信与预留泄漏
/// - medium：额外输出每次放行
/// - high：额外输出预留快照与规则核算明细
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "deny" => Self::Low,
            "medium" | "admit" => Self::Medium,
            "high" | "all" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn denials_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn admissions_enabled(self) -> bool {
        self >= Self::Medium
    }

    pub fn detail_enabled(self) -> bool {
        self >= Self::High
    }
}

pub fn admitted(level: LogLevel, item: &QueueItem, ticket: &ReservationTicket, out: &GateOutput) {
    if !level.admissions_enabled() {
        return;
    }
    tracing::info!(
        item_id = %item.id,
        pool_id = %ticket.pool_id,
        resource_id = %ticket.resource_id,
        reservation_id = %ticket.id,
        retry_count = item.metadata.retry_count,
        reason = out.reason.as_deref().unwrap_or(""),
        "[准入] 放行"
    );
    if level.detail_enabled() {
        tracing::info!(
            "[准入] 预留快照 {}: {}",
            ticket.pool_id,
            serde_json::to_string(&out.allocation).unwrap_or_default()
        );
    }
}

pub fn denied(level: LogLevel, item: &QueueItem, out: &GateOutput) {
    if !level.denials_enabled() {
        return;
    }
    tracing::info!(
        item_id = %item.id,
        pool_id = %item.request.pool_id,
        retry_count = item.metadata.retry_count,
        reason = out.reason.as_deref().unwrap_or(""),
        "[准入] 拒绝"
    );
    if level.detail_enabled()
        && let Some(v) = &out.violation
    {
        tracing::info!(
            "[准入] 规则核算: {}",
            serde_json::to_string(v).unwrap_or_default()
        );
    }
}

pub fn dead_lettered(letter: &DeadLetter) {
    tracing::error!(
        item_id = %letter.item.id,
        pool_id = %letter.item.request.pool_id,
        retry_count = letter.item.metadata.retry_count,
        batch_id = letter.item.context.batch_id.as_deref().unwrap_or(""),
        "[死信] {}",
        letter.reason
    );
}

pub fn reservation_leaked(level: LogLevel, leak: &LeakedReservation) {
    // 泄漏属于异常，只有 off 时才不输出。
    if level == LogLevel::Off {
        return;
    }
    let t = &leak.reservation.ticket;
    tracing::warn!(
        reservation_id = %t.id,
        pool_id = %t.pool_id,
        resource_id = %t.resource_id,
        age_secs = leak.age.as_secs(),
        "[预留] 超过最长在途时长，已强制释放"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parse_and_gates() {
        assert_eq!(LogLevel::parse(" HIGH "), LogLevel::High);
        assert_eq!(LogLevel::parse("medium"), LogLevel::Medium);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Off);
        assert!(LogLevel::Low.denials_enabled());
        assert!(!LogLevel::Low.admissions_enabled());
        assert!(LogLevel::High.detail_enabled());
    }
}
