use crate::gate::{ItemStatus, GateStats};
use crate::queue::{DeadLetter, GateRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// POST /v1/gate 请求体。
#[derive(Debug, Clone, Deserialize)]
pub struct GateBody {
    #[serde(flatten)]
    pub request: GateRequest,
    /// 缺省为服务端当前时间。
    #[serde(default)]
    pub request_time: Option<DateTime<Utc>>,
    /// 原始请求，排队期间原样保存，放行后交还执行方。
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub batch_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueueStatusResponse {
    pub item_id: Uuid,
    #[serde(flatten)]
    pub status: ItemStatus,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub gate: GateStats,
    pub recent_dead_letters: Vec<DeadLetter>,
}

#[derive(Debug, Serialize)]
pub struct SettingsResponse {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
