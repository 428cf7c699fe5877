use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::ports::{DeliveryStore, StoreError, SubscriptionStore};
use crate::outbound::webhook::delivery_queue::DeliveryQueue;
use crate::outbound::webhook::http_client::{HttpClientError, WebhookHttpClient};
use crate::outbound::webhook::retry_scheduler::{
    RetryScheduler, SUBSCRIPTION_DISABLED, SUBSCRIPTION_NOT_FOUND,
};
use crate::outbound::webhook::retry_strategy::RetryStrategy;
use crate::outbound::webhook::schemas::{
    Delivery, DeliveryResponse, DeliveryStatus, DeliveryUpdate,
};
use crate::outbound::webhook::subscription::Subscription;

/// Reason recorded when a delivery could not be queued.
pub const QUEUE_OVERFLOW: &str = "queue overflow";

/// Why a single attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Transport(#[from] HttpClientError),

    #[error("endpoint answered HTTP {status}")]
    HttpStatus {
        status: u16,
        response: DeliveryResponse,
    },

    #[error("delivery has no request to send")]
    MissingRequest,
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_retryable(),
            Self::HttpStatus { .. } => true,
            Self::MissingRequest => false,
        }
    }

    pub fn response(&self) -> Option<&DeliveryResponse> {
        match self {
            Self::HttpStatus { response, .. } => Some(response),
            _ => None,
        }
    }
}

/// Worker pool draining the delivery queue.
///
/// Each worker takes one delivery at a time, performs one HTTP attempt
/// bounded by the subscription timeout and records the outcome. Failed
/// attempts with budget left go to the [`RetryScheduler`]; everything
/// else ends `success` or `abandoned`.
pub struct DeliveryService {
    queue: Arc<DeliveryQueue>,

    scheduler: Arc<RetryScheduler>,

    deliveries: Arc<dyn DeliveryStore>,

    subscriptions: Arc<dyn SubscriptionStore>,

    /// HTTP client reused across all requests.
    http_client: WebhookHttpClient,

    retry_strategy: RetryStrategy,
}

impl DeliveryService {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        scheduler: Arc<RetryScheduler>,
        deliveries: Arc<dyn DeliveryStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        http_client: WebhookHttpClient,
        retry_strategy: RetryStrategy,
    ) -> Self {
        Self {
            queue,
            scheduler,
            deliveries,
            subscriptions,
            http_client,
            retry_strategy,
        }
    }

    /// Start `count` workers. They exit when `token` is cancelled or the
    /// queue is closed; an attempt already in flight is finished first.
    pub fn spawn_workers(self: &Arc<Self>, count: usize, token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(workers = count, "Webhook delivery workers starting");
        (0..count.max(1))
            .map(|worker| tokio::spawn(self.clone().worker_loop(worker, token.clone())))
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, token: CancellationToken) {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.queue.pop() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let delivery_id = delivery.id;
            match AssertUnwindSafe(self.process_delivery(delivery))
                .catch_unwind()
                .await
            {
                Ok(Ok(status)) => {
                    debug!(worker, delivery_id = %delivery_id, %status, "Delivery processed");
                }
                Ok(Err(e)) => {
                    error!(worker, delivery_id = %delivery_id, error = %e, "Delivery store failure");
                }
                Err(_) => {
                    error!(worker, delivery_id = %delivery_id, "Delivery task panicked");
                }
            }
        }
        debug!(worker, "Webhook delivery worker stopped");
    }

    /// Run one attempt for a queued delivery and persist the outcome.
    ///
    /// Returns the status the delivery was left in.
    pub async fn process_delivery(&self, delivery: Delivery) -> Result<DeliveryStatus, StoreError> {
        let subscription = match self.live_subscription(&delivery).await? {
            Ok(subscription) => subscription,
            Err(reason) => return self.abandon(&delivery, reason).await,
        };

        let Some(request) = delivery.request.clone() else {
            return self.abandon(&delivery, &DeliveryError::MissingRequest.to_string()).await;
        };

        let attempt = delivery.attempt_count + 1;
        let delivery = match self
            .deliveries
            .update_status(delivery.id, &DeliveryUpdate::sending(attempt))
            .await
        {
            Ok(updated) => updated,
            Err(StoreError::TerminalState(status)) => {
                debug!(delivery_id = %delivery.id, %status, "Skipping finished delivery");
                return Ok(status);
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                // Another worker already owns this attempt.
                debug!(delivery_id = %delivery.id, status = %from, "Skipping delivery in flight");
                return Ok(from);
            }
            Err(e) => return Err(e),
        };

        let started_at = OffsetDateTime::now_utc();
        if let Err(e) = self.subscriptions.record_attempt(subscription.id, started_at).await {
            warn!(subscription_id = %subscription.id, error = %e, "Failed to record attempt");
        }

        let outcome = match self
            .http_client
            .send(&request, subscription.timeout(), subscription.verify_ssl)
            .await
        {
            Ok(response) if !self.retry_strategy.should_retry_status(response.status_code) => {
                Ok(response)
            }
            Ok(response) => Err(DeliveryError::HttpStatus {
                status: response.status_code,
                response,
            }),
            Err(e) => Err(DeliveryError::Transport(e)),
        };

        match outcome {
            Ok(response) => {
                let (status_code, latency_ms) = (response.status_code, response.latency_ms);
                self.deliveries
                    .update_status(delivery.id, &DeliveryUpdate::success(response))
                    .await?;
                if let Err(e) = self
                    .subscriptions
                    .record_success(subscription.id, OffsetDateTime::now_utc())
                    .await
                {
                    warn!(subscription_id = %subscription.id, error = %e, "Failed to record success");
                }

                info!(
                    delivery_id = %delivery.id,
                    subscription_id = %subscription.id,
                    attempt,
                    status_code,
                    latency_ms,
                    "Webhook delivered successfully"
                );
                Ok(DeliveryStatus::Success)
            }
            Err(err) => {
                let failed = self
                    .deliveries
                    .update_status(
                        delivery.id,
                        &DeliveryUpdate::failed(err.to_string(), err.response().cloned()),
                    )
                    .await?;
                self.settle_failure(&failed, &subscription, &err.to_string(), err.is_retryable())
                    .await
            }
        }
    }

    /// Pick up a delivery left non-terminal by a previous run.
    pub async fn resume(&self, delivery: Delivery) -> Result<DeliveryStatus, StoreError> {
        match delivery.status {
            DeliveryStatus::Pending => match self.queue.push(delivery).await {
                Ok(_) => Ok(DeliveryStatus::Pending),
                Err(overflow) => self.abandon(&overflow.delivery, QUEUE_OVERFLOW).await,
            },
            DeliveryStatus::Sending => {
                let failed = self
                    .deliveries
                    .update_status(
                        delivery.id,
                        &DeliveryUpdate::failed("attempt interrupted by shutdown", None),
                    )
                    .await?;
                self.settle_interrupted(failed).await
            }
            DeliveryStatus::Failed => self.settle_interrupted(delivery).await,
            DeliveryStatus::Retrying => {
                self.scheduler.schedule(delivery).await;
                Ok(DeliveryStatus::Retrying)
            }
            status => Ok(status),
        }
    }

    async fn settle_interrupted(&self, failed: Delivery) -> Result<DeliveryStatus, StoreError> {
        let reason = failed
            .last_error
            .clone()
            .unwrap_or_else(|| "delivery failed".to_string());

        if failed.request.is_none() {
            return self.abandon(&failed, &reason).await;
        }
        match self.live_subscription(&failed).await? {
            Ok(subscription) => self.settle_failure(&failed, &subscription, &reason, true).await,
            Err(why) => self.abandon(&failed, why).await,
        }
    }

    /// Move a `failed` delivery to `retrying` or `abandoned`.
    async fn settle_failure(
        &self,
        failed: &Delivery,
        subscription: &Subscription,
        reason: &str,
        retryable: bool,
    ) -> Result<DeliveryStatus, StoreError> {
        let attempt = failed.attempt_count;

        if retryable && self.retry_strategy.should_retry(attempt, failed.max_attempts) {
            let delay = self
                .retry_strategy
                .next_delay(subscription.retry_backoff(), attempt);
            let next_retry_at = OffsetDateTime::now_utc() + delay;
            let retrying = self
                .deliveries
                .update_status(failed.id, &DeliveryUpdate::retrying(next_retry_at))
                .await?;

            warn!(
                delivery_id = %failed.id,
                subscription_id = %subscription.id,
                attempt,
                max_attempts = failed.max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = reason,
                "Webhook delivery failed, will retry"
            );
            self.scheduler.schedule(retrying).await;
            return Ok(DeliveryStatus::Retrying);
        }

        let reason = if retryable {
            format!("failed after {attempt} attempt(s): {reason}")
        } else {
            reason.to_string()
        };
        let status = self.abandon(failed, &reason).await?;
        if let Err(e) = self
            .subscriptions
            .record_failure(subscription.id, OffsetDateTime::now_utc())
            .await
        {
            warn!(subscription_id = %subscription.id, error = %e, "Failed to record failure");
        }
        Ok(status)
    }

    /// The enabled subscription a delivery belongs to, or why there is none.
    async fn live_subscription(
        &self,
        delivery: &Delivery,
    ) -> Result<Result<Subscription, &'static str>, StoreError> {
        Ok(
            match self
                .subscriptions
                .get_subscription(delivery.subscription_id)
                .await?
            {
                Some(subscription) if subscription.enabled => Ok(subscription),
                Some(_) => Err(SUBSCRIPTION_DISABLED),
                None => Err(SUBSCRIPTION_NOT_FOUND),
            },
        )
    }

    async fn abandon(&self, delivery: &Delivery, reason: &str) -> Result<DeliveryStatus, StoreError> {
        match self
            .deliveries
            .update_status(delivery.id, &DeliveryUpdate::abandoned(reason))
            .await
        {
            Ok(_) => {
                error!(
                    delivery_id = %delivery.id,
                    subscription_id = %delivery.subscription_id,
                    attempt = delivery.attempt_count,
                    reason,
                    "Webhook delivery abandoned"
                );
                Ok(DeliveryStatus::Abandoned)
            }
            Err(StoreError::TerminalState(status)) => Ok(status),
            Err(e) => Err(e),
        }
    }
}
