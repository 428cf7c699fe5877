use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::server::AppState;
use crate::server::responses::ResponseBody;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub engine: &'static str,
}

/// `200` while the delivery engine runs, `503` otherwise.
pub async fn health_check(State(state): State<AppState>) -> ResponseBody<Health> {
    if state.manager.is_running().await {
        ResponseBody::new(StatusCode::OK, Health { engine: "running" })
    } else {
        ResponseBody::new(StatusCode::SERVICE_UNAVAILABLE, Health { engine: "stopped" })
    }
}
