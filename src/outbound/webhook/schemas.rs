use case_events::{Event, RelatedObjects};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::subscription::Subscription;

/// Default JSON envelope sent to external systems.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookPayload {
    pub event: String,

    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    pub webhook: WebhookRef,

    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookRef {
    pub id: Uuid,
    pub name: String,
}

impl WebhookPayload {
    pub fn new(subscription: &Subscription, event: &Event) -> Self {
        Self {
            event: event.kind().to_string(),
            timestamp: event.timestamp,
            webhook: WebhookRef {
                id: subscription.id,
                name: subscription.name.clone(),
            },
            data: event.payload.clone(),
        }
    }

    /// Compact serialization; these bytes are what gets signed and sent.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An outbound request, frozen when the delivery is created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// State of a delivery
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,

    Sending,

    Success,

    Failed,

    Retrying,

    Abandoned,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Abandoned)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Sending | Abandoned)
                | (Sending, Success | Failed | Abandoned)
                | (Failed, Retrying | Abandoned)
                | (Retrying, Sending | Abandoned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of the last HTTP response received for a delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub latency_ms: u64,
}

/// One entry of a delivery's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryTransition {
    pub status: DeliveryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("delivery is already {0}")]
    TerminalState(DeliveryStatus),

    #[error("cannot move delivery from {from} to {to}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("attempt {attempt} exceeds the limit of {max}")]
    AttemptLimit { attempt: u32, max: u32 },

    #[error("retrying requires a next retry time")]
    MissingRetryTime,
}

/// A status change plus the attempt metadata that goes with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub at: OffsetDateTime,
    pub attempt_count: Option<u32>,
    pub next_retry_at: Option<OffsetDateTime>,
    pub response: Option<DeliveryResponse>,
    pub error: Option<String>,
}

impl DeliveryUpdate {
    fn new(status: DeliveryStatus) -> Self {
        Self {
            status,
            at: OffsetDateTime::now_utc(),
            attempt_count: None,
            next_retry_at: None,
            response: None,
            error: None,
        }
    }

    /// Start attempt number `attempt` (1-indexed).
    pub fn sending(attempt: u32) -> Self {
        Self {
            attempt_count: Some(attempt),
            ..Self::new(DeliveryStatus::Sending)
        }
    }

    pub fn success(response: DeliveryResponse) -> Self {
        Self {
            response: Some(response),
            ..Self::new(DeliveryStatus::Success)
        }
    }

    pub fn failed(error: impl Into<String>, response: Option<DeliveryResponse>) -> Self {
        Self {
            error: Some(error.into()),
            response,
            ..Self::new(DeliveryStatus::Failed)
        }
    }

    pub fn retrying(next_retry_at: OffsetDateTime) -> Self {
        Self {
            next_retry_at: Some(next_retry_at),
            ..Self::new(DeliveryStatus::Retrying)
        }
    }

    pub fn abandoned(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(DeliveryStatus::Abandoned)
        }
    }

    pub fn at(mut self, at: OffsetDateTime) -> Self {
        self.at = at;
        self
    }
}

/// One tracked lineage of attempts to send an event to a subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,
    /// `None` only when the request could not be built.
    pub request: Option<RenderedRequest>,
    pub last_response: Option<DeliveryResponse>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub related: RelatedObjects,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub history: Vec<DeliveryTransition>,
}

impl Delivery {
    /// A fresh `pending` delivery carrying a built request.
    pub fn pending(
        id: Uuid,
        subscription: &Subscription,
        event: &Event,
        request: RenderedRequest,
    ) -> Self {
        Self::with_status(id, subscription, event, Some(request), DeliveryStatus::Pending, None)
    }

    /// A synthetic `failed` delivery for a request that could not be built.
    pub fn build_failed(
        id: Uuid,
        subscription: &Subscription,
        event: &Event,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        let mut delivery = Self::with_status(
            id,
            subscription,
            event,
            None,
            DeliveryStatus::Failed,
            Some(error.clone()),
        );
        delivery.last_error = Some(error);
        delivery
    }

    fn with_status(
        id: Uuid,
        subscription: &Subscription,
        event: &Event,
        request: Option<RenderedRequest>,
        status: DeliveryStatus,
        note: Option<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            subscription_id: subscription.id,
            event_id: event.id,
            event_type: event.kind().to_string(),
            status,
            attempt_count: 0,
            max_attempts: subscription.max_attempts(),
            next_retry_at: None,
            request,
            last_response: None,
            last_error: None,
            related: event.related.clone(),
            created_at: now,
            updated_at: now,
            history: vec![DeliveryTransition {
                status,
                at: now,
                attempt: 0,
                note,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// Apply a transition, appending it to the history.
    ///
    /// Nothing is modified when the transition is rejected.
    pub fn apply(&mut self, update: &DeliveryUpdate) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::TerminalState(self.status));
        }
        if !self.status.can_transition_to(update.status) {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: update.status,
            });
        }
        if let Some(attempt) = update.attempt_count
            && attempt > self.max_attempts
        {
            return Err(TransitionError::AttemptLimit {
                attempt,
                max: self.max_attempts,
            });
        }
        if update.status == DeliveryStatus::Retrying && update.next_retry_at.is_none() {
            return Err(TransitionError::MissingRetryTime);
        }

        if let Some(attempt) = update.attempt_count {
            self.attempt_count = attempt;
        }
        self.status = update.status;
        self.next_retry_at = match update.status {
            DeliveryStatus::Retrying => update.next_retry_at,
            _ => None,
        };
        if let Some(response) = &update.response {
            self.last_response = Some(response.clone());
        }
        match (&update.error, update.status) {
            (Some(error), _) => self.last_error = Some(error.clone()),
            (None, DeliveryStatus::Success) => self.last_error = None,
            _ => {}
        }
        self.updated_at = update.at;

        let note = update.error.clone().or_else(|| {
            update
                .next_retry_at
                .filter(|_| update.status == DeliveryStatus::Retrying)
                .map(|at| format!("next attempt at {at}"))
        });
        self.history.push(DeliveryTransition {
            status: update.status,
            at: update.at,
            attempt: self.attempt_count,
            note,
        });

        Ok(())
    }
}
