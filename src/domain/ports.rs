/*
   This module specifies the API by which the delivery engine talks to the
   persistence layer that owns webhook configuration and delivery records.
*/

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::outbound::webhook::schemas::{Delivery, DeliveryStatus, DeliveryUpdate, TransitionError};
use crate::outbound::webhook::subscription::Subscription;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: Uuid },

    #[error("delivery is already {0} and cannot change")]
    TerminalState(DeliveryStatus),

    #[error("cannot move delivery from {from} to {to}")]
    InvalidTransition {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("invalid delivery update: {0}")]
    InvalidUpdate(String),

    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn delivery_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "delivery",
            id,
        }
    }

    pub fn subscription_not_found(id: Uuid) -> Self {
        Self::NotFound {
            kind: "subscription",
            id,
        }
    }
}

impl From<TransitionError> for StoreError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::TerminalState(status) => Self::TerminalState(status),
            TransitionError::InvalidTransition { from, to } => {
                Self::InvalidTransition { from, to }
            }
            other => Self::InvalidUpdate(other.to_string()),
        }
    }
}

/// Durable log of deliveries and their transitions.
///
/// This is the source of truth: the queue and the retry scheduler are
/// rebuilt from it after a restart.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Persist a new delivery. Fails with `AlreadyExists` for a known id.
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError>;

    /// Apply a transition atomically and return the updated record.
    async fn update_status(&self, id: Uuid, update: &DeliveryUpdate)
    -> Result<Delivery, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>, StoreError>;

    /// `retrying` deliveries whose next attempt is due at or before `before`.
    async fn get_due_retries(&self, before: OffsetDateTime) -> Result<Vec<Delivery>, StoreError>;

    /// Non-terminal deliveries that are not waiting on a retry timer.
    async fn get_pending(&self) -> Result<Vec<Delivery>, StoreError>;

    async fn list_for_subscription(&self, subscription_id: Uuid)
    -> Result<Vec<Delivery>, StoreError>;
}

/// Webhook configuration as seen by the delivery engine.
///
/// Statistic updates are atomic per call so that concurrent workers
/// delivering to the same subscription never lose an increment.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, StoreError>;

    async fn list_for_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<Subscription>, StoreError>;

    /// An attempt started.
    async fn record_attempt(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError>;

    async fn record_success(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError>;

    async fn record_failure(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError>;
}
