use case_events::Event;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::delivery_queue::{DeliveryQueue, PushOutcome};
use super::delivery_service::QUEUE_OVERFLOW;
use super::filter::matches;
use super::payload::{PayloadBuilder, delivery_id_for};
use super::schemas::{Delivery, DeliveryUpdate};
use super::subscription::Subscription;
use crate::domain::ports::{DeliveryStore, StoreError};

/// Failures to accept a dispatch at all. Per-subscription problems never
/// surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("webhook engine is not running")]
    NotRunning,

    #[error("subscription lookup failed: {0}")]
    SubscriptionLookup(#[from] StoreError),
}

/// What a dispatch call did, per matched subscription.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub event_id: Uuid,
    pub matched: usize,
    /// Deliveries handed to the worker pool.
    pub queued: Vec<Uuid>,
    /// Deliveries whose request could not be built.
    pub build_failed: Vec<Uuid>,
    /// Deliveries abandoned because the queue was full.
    pub overflowed: Vec<Uuid>,
    /// Already dispatched for this (event, subscription) pair.
    pub duplicates: usize,
    pub store_errors: usize,
}

/// Fans an event out to matching subscriptions.
///
/// Runs on the caller's task. It never touches the network; the only
/// wait is the bounded enqueue when the queue is full.
pub struct Dispatcher {
    builder: PayloadBuilder,
    queue: Arc<DeliveryQueue>,
    deliveries: Arc<dyn DeliveryStore>,
}

impl Dispatcher {
    pub fn new(
        builder: PayloadBuilder,
        queue: Arc<DeliveryQueue>,
        deliveries: Arc<dyn DeliveryStore>,
    ) -> Self {
        Self {
            builder,
            queue,
            deliveries,
        }
    }

    pub async fn dispatch(
        &self,
        event: &Event,
        candidates: &[Subscription],
    ) -> Result<DispatchReport, DispatchError> {
        if self.queue.is_closed() {
            return Err(DispatchError::NotRunning);
        }

        let mut report = DispatchReport {
            event_id: event.id,
            ..DispatchReport::default()
        };

        for subscription in candidates.iter().filter(|s| matches(s, event)) {
            report.matched += 1;
            self.dispatch_one(event, subscription, &mut report).await;
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            candidates = candidates.len(),
            matched = report.matched,
            queued = report.queued.len(),
            "Event dispatched"
        );
        Ok(report)
    }

    /// Everything that can go wrong for one subscription stays here.
    async fn dispatch_one(&self, event: &Event, subscription: &Subscription, report: &mut DispatchReport) {
        let id = delivery_id_for(event.id, subscription.id);

        let request = match self.builder.build(subscription, event) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    delivery_id = %id,
                    subscription_id = %subscription.id,
                    error = %e,
                    "Failed to build webhook request"
                );
                let delivery = Delivery::build_failed(id, subscription, event, e.to_string());
                if self.record(&delivery, report).await {
                    self.abandon(id, &e.to_string(), report).await;
                    report.build_failed.push(id);
                }
                return;
            }
        };

        let delivery = Delivery::pending(id, subscription, event, request);
        if !self.record(&delivery, report).await {
            return;
        }

        match self.queue.push(delivery).await {
            Ok(PushOutcome::Queued) => report.queued.push(id),
            Ok(PushOutcome::Evicted(oldest)) => {
                report.queued.push(id);
                report.overflowed.push(oldest.id);
                self.abandon(oldest.id, QUEUE_OVERFLOW, report).await;
            }
            Err(overflow) => {
                report.overflowed.push(overflow.delivery.id);
                self.abandon(overflow.delivery.id, QUEUE_OVERFLOW, report).await;
            }
        }
    }

    /// Persist a new delivery; `false` when it must not go further.
    async fn record(&self, delivery: &Delivery, report: &mut DispatchReport) -> bool {
        match self.deliveries.create(delivery).await {
            Ok(()) => true,
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(delivery_id = %delivery.id, "Delivery already exists, skipping");
                report.duplicates += 1;
                false
            }
            Err(e) => {
                error!(delivery_id = %delivery.id, error = %e, "Failed to persist delivery");
                report.store_errors += 1;
                false
            }
        }
    }

    async fn abandon(&self, id: Uuid, reason: &str, report: &mut DispatchReport) {
        match self
            .deliveries
            .update_status(id, &DeliveryUpdate::abandoned(reason))
            .await
        {
            Ok(_) => error!(delivery_id = %id, reason, "Webhook delivery abandoned"),
            Err(e) => {
                error!(delivery_id = %id, error = %e, "Failed to abandon delivery");
                report.store_errors += 1;
            }
        }
    }
}
