use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use uuid::Uuid;

use crate::domain::ports::{StoreError, SubscriptionStore};
use crate::outbound::webhook::{Delivery, Subscription};
use crate::server::AppState;
use crate::server::responses::{ApiError, ResponseBody};

pub async fn create_webhook(
    State(state): State<AppState>,
    Json(subscription): Json<Subscription>,
) -> Result<ResponseBody<Subscription>, ApiError> {
    let subscription = state.subscriptions.register(subscription)?;
    tracing::info!(
        subscription_id = %subscription.id,
        organization_id = subscription.organization_id,
        url = %subscription.url,
        "Webhook registered"
    );
    Ok(ResponseBody::new(StatusCode::CREATED, subscription))
}

pub async fn list_webhooks(
    State(state): State<AppState>,
) -> Result<ResponseBody<Vec<Subscription>>, ApiError> {
    Ok(ResponseBody::new(StatusCode::OK, state.subscriptions.list()?))
}

pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseBody<Subscription>, ApiError> {
    let subscription = state
        .subscriptions
        .get_subscription(id)
        .await?
        .ok_or_else(|| StoreError::subscription_not_found(id))?;
    Ok(ResponseBody::new(StatusCode::OK, subscription))
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    match state.subscriptions.remove(id)? {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(StoreError::subscription_not_found(id).into()),
    }
}

pub async fn enable_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.subscriptions.set_enabled(id, true)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Disabling stops new deliveries; pending retries are abandoned at their
/// next attempt.
pub async fn disable_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.subscriptions.set_enabled(id, false)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_webhook_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<ResponseBody<Vec<Delivery>>, ApiError> {
    let deliveries = state.manager.list_deliveries(id).await?;
    Ok(ResponseBody::new(StatusCode::OK, deliveries))
}
