//! HTTP 适配层：把准入入口与完成回报暴露为 JSON 接口。

pub mod handler;
pub mod types;

use crate::gate::GateOrchestrator;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub struct GatewayState {
    pub orchestrator: Arc<GateOrchestrator>,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/v1/gate", post(handler::handle_gate))
        .route("/v1/complete", post(handler::handle_complete))
        .route("/v1/queue/{id}", get(handler::handle_queue_status))
        .route("/stats", get(handler::handle_stats))
        .route("/settings", get(handler::handle_settings_get))
        .route("/settings", post(handler::handle_settings_post))
        .route("/health", get(handler::handle_health))
        .with_state(state)
}
