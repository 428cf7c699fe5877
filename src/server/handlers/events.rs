use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use case_events::{Event, RelatedObjects};
use serde::Deserialize;
use serde_json::Value;

use crate::outbound::webhook::DispatchReport;
use crate::server::AppState;
use crate::server::responses::{ApiError, ResponseBody};

/// An event raised by the core, before it gets an id and timestamp.
#[derive(Debug, Deserialize)]
pub struct PublishEvent {
    pub event_type: String,
    pub organization_id: i64,
    #[serde(default)]
    pub triggered_by: Option<i64>,
    #[serde(default)]
    pub related: RelatedObjects,
    #[serde(default)]
    pub payload: Value,
}

impl From<PublishEvent> for Event {
    fn from(request: PublishEvent) -> Self {
        let mut event = Event::new(request.event_type.as_str(), request.payload)
            .with_organization(request.organization_id)
            .with_related(request.related);
        event.triggered_by = request.triggered_by;
        event
    }
}

/// Fan an event out to the organization's webhooks. Answers `202` once
/// deliveries are recorded; sending continues in the background.
pub async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishEvent>,
) -> Result<ResponseBody<DispatchReport>, ApiError> {
    if request.event_type.trim().is_empty() {
        return Err(ApiError::Unprocessable("event_type must not be empty".into()));
    }
    let event = Event::from(request);
    let report = state.manager.dispatch_to_organization(&event).await?;
    Ok(ResponseBody::new(StatusCode::ACCEPTED, report))
}
