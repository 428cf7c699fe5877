use axum::extract::{Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::domain::ports::StoreError;
use crate::outbound::webhook::Delivery;
use crate::server::AppState;
use crate::server::responses::{ApiError, ResponseBody};

pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseBody<Delivery>, ApiError> {
    let delivery = state
        .manager
        .get_delivery(id)
        .await?
        .ok_or_else(|| StoreError::delivery_not_found(id))?;
    Ok(ResponseBody::new(StatusCode::OK, delivery))
}
