//! 准入编排：请求 → 判定 → （放行 | 重新排队 | 死信）。

mod orchestrator;
mod tasks;

pub use orchestrator::{GateComponents, GateOrchestrator};
pub use tasks::{spawn_scheduler, spawn_sweep_task};

use crate::allocation::{PoolWorkloadAllocation, ReservationTicket};
use crate::queue::Priority;
use crate::strategy::GateOutput;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// 请求本身无法判定（配置层面的问题），不同于配额拒绝。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("未知的池: {0}")]
    UnknownPool(String),

    #[error("池 {pool_id} 中不存在条目 {resource_id}")]
    UnknownResource { pool_id: String, resource_id: String },

    #[error("池 {pool_id} 中不存在连接 {connection_id}")]
    UnknownConnection {
        pool_id: String,
        connection_id: String,
    },

    #[error("池 {0} 没有定义条目，请求必须指定 resource_id 或 connection_id")]
    NoEligibleEntry(String),
}

/// 判定之后请求的去向。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Disposition {
    Admitted {
        ticket: ReservationTicket,
        connection_id: String,
    },
    Queued {
        item_id: Uuid,
        retry_count: u32,
        retry_after_ms: u64,
    },
    DeadLettered {
        item_id: Uuid,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateDecision {
    #[serde(flatten)]
    pub output: GateOutput,
    pub disposition: Disposition,
}

/// 队列 item 的可查询状态。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemStatus {
    Queued {
        retry_count: u32,
        retry_after_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Admitted {
        ticket: ReservationTicket,
        connection_id: String,
    },
    DeadLettered {
        reason: String,
    },
    Completed,
    ReservationExpired {
        reservation_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Success,
    Failure,
    /// 执行方认为可重试的失败（例如上游 429/5xx），item 会重新排队。
    TransientFailure,
}

/// 执行方的完成回报。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub ticket: ReservationTicket,
    /// 实际消耗的 token；缺省时按放行时的预估值计量。
    #[serde(default)]
    pub actual_tokens: Option<u64>,
    #[serde(default)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompletionResult {
    Recorded,
    Requeued { item_id: Uuid, retry_after_ms: u64 },
    DeadLettered { item_id: Uuid },
    /// 凭据已释放过（重复回报或已被清扫）。
    UnknownReservation,
}

/// 一轮到期重试的结果统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DueSummary {
    pub offered: usize,
    pub admitted: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateStats {
    pub strategy: &'static str,
    pub pools: usize,
    pub queue_depth: BTreeMap<Priority, usize>,
    pub queued_total: usize,
    pub dead_lettered_total: u64,
    pub in_flight: usize,
    pub reservations: Vec<PoolWorkloadAllocation>,
}
