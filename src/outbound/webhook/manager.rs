use case_events::{Event, EventType};
use futures::future::join_all;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::delivery_queue::DeliveryQueue;
use super::delivery_service::DeliveryService;
use super::dispatcher::{DispatchError, DispatchReport, Dispatcher};
use super::filter::event_organization;
use super::http_client::{HttpClientError, WebhookHttpClient};
use super::payload::PayloadBuilder;
use super::retry_scheduler::RetryScheduler;
use super::retry_strategy::RetryStrategy;
use super::schemas::Delivery;
use super::subscription::Subscription;
use crate::config::WebhookEngineConfig;
use crate::domain::ports::{DeliveryStore, StoreError, SubscriptionStore};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("webhook engine is already running")]
    AlreadyRunning,

    #[error(transparent)]
    HttpClient(#[from] HttpClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Running parts of the engine; rebuilt on every start.
struct Engine {
    queue: Arc<DeliveryQueue>,
    dispatcher: Dispatcher,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Entry point of the delivery engine.
///
/// An explicitly constructed service with its own queue, scheduler and
/// workers. Any number of independent instances can coexist.
pub struct WebhookManager {
    config: WebhookEngineConfig,
    deliveries: Arc<dyn DeliveryStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    engine: RwLock<Option<Engine>>,
}

impl WebhookManager {
    pub fn new(
        config: WebhookEngineConfig,
        deliveries: Arc<dyn DeliveryStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            config,
            deliveries,
            subscriptions,
            engine: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &WebhookEngineConfig {
        &self.config
    }

    /// Spawn workers and the retry scheduler, then resume whatever a
    /// previous run left unfinished in the delivery store.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut slot = self.engine.write().await;
        if slot.is_some() {
            return Err(ManagerError::AlreadyRunning);
        }

        let queue = Arc::new(DeliveryQueue::new(
            self.config.queue_capacity,
            self.config.overflow_policy,
            self.config.enqueue_timeout,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            queue.clone(),
            self.deliveries.clone(),
            self.subscriptions.clone(),
        ));
        let service = Arc::new(DeliveryService::new(
            queue.clone(),
            scheduler.clone(),
            self.deliveries.clone(),
            self.subscriptions.clone(),
            WebhookHttpClient::new(&self.config.user_agent)?,
            RetryStrategy::new(self.config.backoff_cap, self.config.jitter_ratio),
        ));
        let dispatcher = Dispatcher::new(
            PayloadBuilder::new(self.config.user_agent.clone()),
            queue.clone(),
            self.deliveries.clone(),
        );

        let token = CancellationToken::new();
        let mut tasks = service.spawn_workers(self.config.workers, token.clone());

        // The scheduler starts ticking only once recovery has filled it.
        let recovery = async {
            let horizon = OffsetDateTime::now_utc() + self.config.backoff_cap + self.config.retry_tick;
            let retries = scheduler.recover(horizon).await?;

            let pending = self.deliveries.get_pending().await?;
            let resumed = pending.len();
            for delivery in pending {
                let id = delivery.id;
                if let Err(e) = service.resume(delivery).await {
                    error!(delivery_id = %id, error = %e, "Failed to resume delivery");
                }
            }
            Ok::<_, StoreError>((resumed, retries))
        };

        match recovery.await {
            Ok((resumed, retries)) => info!(
                workers = self.config.workers,
                queue_capacity = self.config.queue_capacity,
                resumed,
                retries,
                "Webhook engine started"
            ),
            Err(e) => {
                token.cancel();
                queue.close();
                return Err(e.into());
            }
        }

        tasks.push(scheduler.spawn(token.clone(), self.config.retry_tick));

        *slot = Some(Engine {
            queue,
            dispatcher,
            token,
            tasks,
        });
        Ok(())
    }

    /// Stop accepting work, give in-flight attempts the grace period, then
    /// abort what is left. Queued and scheduled deliveries keep their
    /// persisted `pending`/`retrying` status for the next start.
    pub async fn stop(&self) {
        let Some(engine) = self.engine.write().await.take() else {
            return;
        };

        engine.token.cancel();
        engine.queue.close();

        let abort_handles: Vec<_> = engine.tasks.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(self.config.shutdown_grace, join_all(engine.tasks)).await {
            Ok(_) => info!("Webhook engine stopped"),
            Err(_) => {
                warn!(
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "Shutdown grace period elapsed, aborting delivery tasks"
                );
                for handle in abort_handles {
                    handle.abort();
                }
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.engine.read().await.is_some()
    }

    /// Fan `event` out to `candidates`. Returns once every matching
    /// delivery is recorded and queued; sending happens in the background.
    pub async fn dispatch(
        &self,
        event: &Event,
        candidates: &[Subscription],
    ) -> Result<DispatchReport, DispatchError> {
        match self.engine.read().await.as_ref() {
            Some(engine) => engine.dispatcher.dispatch(event, candidates).await,
            None => Err(DispatchError::NotRunning),
        }
    }

    /// Dispatch to every subscription of the event's organization.
    pub async fn dispatch_to_organization(
        &self,
        event: &Event,
    ) -> Result<DispatchReport, DispatchError> {
        if !self.is_running().await {
            return Err(DispatchError::NotRunning);
        }
        let Some(organization_id) = event_organization(event) else {
            warn!(event_id = %event.id, "Event has no organization, nothing to dispatch");
            return Ok(DispatchReport {
                event_id: event.id,
                ..DispatchReport::default()
            });
        };

        let candidates = self
            .subscriptions
            .list_for_organization(organization_id)
            .await?;
        self.dispatch(event, &candidates).await
    }

    /// Read-only delivery lookup for audit surfaces.
    pub async fn get_delivery(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
        self.deliveries.get(id).await
    }

    pub async fn list_deliveries(&self, subscription_id: Uuid) -> Result<Vec<Delivery>, StoreError> {
        self.deliveries.list_for_subscription(subscription_id).await
    }

    pub async fn trigger_case_created(
        &self,
        organization_id: i64,
        case: Value,
        triggered_by: Option<i64>,
    ) -> Result<DispatchReport, DispatchError> {
        let event = case_event(
            EventType::CASE_CREATED,
            organization_id,
            json!({ "case": case }),
            &case,
            triggered_by,
        );
        self.dispatch_to_organization(&event).await
    }

    pub async fn trigger_case_updated(
        &self,
        organization_id: i64,
        case: Value,
        changes: Value,
        triggered_by: Option<i64>,
    ) -> Result<DispatchReport, DispatchError> {
        let event = case_event(
            EventType::CASE_UPDATED,
            organization_id,
            json!({ "case": case, "changes": changes }),
            &case,
            triggered_by,
        );
        self.dispatch_to_organization(&event).await
    }

    pub async fn trigger_task_completed(
        &self,
        organization_id: i64,
        case_id: i64,
        task: Value,
        triggered_by: Option<i64>,
    ) -> Result<DispatchReport, DispatchError> {
        let mut event = Event::new(EventType::TASK_COMPLETED, json!({ "task": task }))
            .with_organization(organization_id)
            .with_case(case_id);
        if let Some(task_id) = task.get("id").and_then(Value::as_i64) {
            event = event.with_task(task_id);
        }
        if let Some(user) = triggered_by {
            event = event.with_triggered_by(user);
        }
        self.dispatch_to_organization(&event).await
    }

    pub async fn trigger_cortex_job_completed(
        &self,
        organization_id: i64,
        job: Value,
    ) -> Result<DispatchReport, DispatchError> {
        let mut event = Event::new(EventType::CORTEX_JOB_COMPLETED, json!({ "job": job }))
            .with_organization(organization_id);
        event.related.job_id = job.get("id").map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        if let Some(case_id) = job.get("case_id").and_then(Value::as_i64) {
            event = event.with_case(case_id);
        }
        self.dispatch_to_organization(&event).await
    }
}

fn case_event(
    kind: &str,
    organization_id: i64,
    payload: Value,
    case: &Value,
    triggered_by: Option<i64>,
) -> Event {
    let mut event = Event::new(kind, payload).with_organization(organization_id);
    if let Some(case_id) = case.get("id").and_then(Value::as_i64) {
        event = event.with_case(case_id);
    }
    if let Some(user) = triggered_by {
        event = event.with_triggered_by(user);
    }
    event
}
