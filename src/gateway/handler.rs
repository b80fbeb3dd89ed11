use crate::error::AppError;
use crate::gate::CompletionReport;
use crate::gateway::GatewayState;
use crate::gateway::types::{
    GateBody, QueueStatusResponse, SettingsResponse, StatsResponse,
};
use crate::queue::ItemContext;
use crate::runtime_config::SettingsUpdate;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// POST /v1/gate - 判定一次请求
///
/// 放行返回 200 与预留凭据；拒绝返回 202（已排队）或 200（已进死信），body 中带原因。
pub async fn handle_gate(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Json(body): Json<GateBody>,
) -> Result<Response, AppError> {
    if body.request.pool_id.trim().is_empty() {
        return Err(AppError::bad_request("pool_id 不能为空"));
    }

    let context = ItemContext {
        batch_id: body.batch_id,
        api_key: extract_api_key(&headers),
    };
    let decision = state
        .orchestrator
        .gate_request(
            body.request,
            body.request_time.unwrap_or_else(Utc::now),
            body.payload,
            context,
        )
        .await?;

    let status = match decision.disposition {
        crate::gate::Disposition::Queued { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(decision)).into_response())
}

/// POST /v1/complete - 执行完成回报
pub async fn handle_complete(
    State(state): State<Arc<GatewayState>>,
    Json(report): Json<CompletionReport>,
) -> Response {
    let result = state.orchestrator.report_completion(report).await;
    Json(result).into_response()
}

/// GET /v1/queue/{id} - 查询排队 item 状态
pub async fn handle_queue_status(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let item_id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::bad_request(format!("无效的 item id: {id}")))?;
    let status = state
        .orchestrator
        .item_status(item_id)
        .await
        .ok_or_else(|| AppError::not_found(format!("item {item_id} 不存在或已过期")))?;
    Ok(Json(QueueStatusResponse { item_id, status }).into_response())
}

/// GET /stats - 队列深度、死信与预留概览
pub async fn handle_stats(State(state): State<Arc<GatewayState>>) -> Response {
    let gate = state.orchestrator.stats().await;
    let recent_dead_letters = state.orchestrator.recent_dead_letters().await;
    Json(StatsResponse {
        gate,
        recent_dead_letters,
    })
    .into_response()
}

/// GET /settings - 当前运行时配置
pub async fn handle_settings_get(State(state): State<Arc<GatewayState>>) -> Response {
    let settings = state.orchestrator.settings().get();
    Json(&*settings).into_response()
}

/// POST /settings - 局部更新运行时配置，立即生效
pub async fn handle_settings_post(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SettingsUpdate>,
) -> Response {
    let handle = state.orchestrator.settings();
    let current = handle.get();
    let next = req.apply_to(&current);

    if let Err(msg) = handle.update(next.clone()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(SettingsResponse {
                success: false,
                error: Some(msg.to_string()),
            }),
        )
            .into_response();
    }

    tracing::info!(
        "设置已更新: Debug={}, FailPolicy={:?}, MaxRetries={}",
        next.debug,
        next.fail_policy,
        next.backoff.max_retries
    );

    Json(SettingsResponse {
        success: true,
        error: None,
    })
    .into_response()
}

pub async fn handle_health() -> &'static str {
    "ok"
}

/// 读取 `Authorization: Bearer <key>` 或 `x-api-key`。
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("Bearer "))
        .map(str::trim);
    let key = bearer.or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    })?;
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}
