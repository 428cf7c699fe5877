use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::delivery_queue::DeliveryQueue;
use super::schemas::{Delivery, DeliveryStatus, DeliveryUpdate};
use crate::domain::ports::{DeliveryStore, StoreError, SubscriptionStore};

pub const SUBSCRIPTION_DISABLED: &str = "subscription disabled";
pub const SUBSCRIPTION_NOT_FOUND: &str = "subscription not found";

#[derive(Debug)]
struct Scheduled {
    due: OffsetDateTime,
    seq: u64,
    delivery: Delivery,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct Timeline {
    heap: BinaryHeap<Reverse<Scheduled>>,
    ids: HashSet<Uuid>,
    next_seq: u64,
}

impl Timeline {
    fn insert(&mut self, due: OffsetDateTime, delivery: Delivery) -> bool {
        if !self.ids.insert(delivery.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Scheduled { due, seq, delivery }));
        true
    }

    fn pop_due(&mut self, now: OffsetDateTime) -> Vec<Delivery> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|Reverse(s)| s.due <= now) {
            if let Some(Reverse(scheduled)) = self.heap.pop() {
                self.ids.remove(&scheduled.delivery.id);
                due.push(scheduled.delivery);
            }
        }
        due
    }
}

/// Outcome of one scheduler tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub requeued: usize,
    pub abandoned: usize,
    /// Due but put back, because the queue was full or a store call failed.
    pub deferred: usize,
}

/// Holds `retrying` deliveries ordered by their next attempt time and feeds
/// them back to the queue once due.
///
/// The subscription is looked up again at re-enqueue time, so a delivery
/// whose subscription was disabled in the meantime is abandoned instead of
/// being retried.
pub struct RetryScheduler {
    timeline: Mutex<Timeline>,
    queue: Arc<DeliveryQueue>,
    deliveries: Arc<dyn DeliveryStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl RetryScheduler {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        deliveries: Arc<dyn DeliveryStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            timeline: Mutex::new(Timeline::default()),
            queue,
            deliveries,
            subscriptions,
        }
    }

    /// Hold a `retrying` delivery until its next attempt is due.
    ///
    /// Returns `false` when the delivery is not retrying or is already held.
    pub async fn schedule(&self, delivery: Delivery) -> bool {
        let due = match (delivery.status, delivery.next_retry_at) {
            (DeliveryStatus::Retrying, Some(due)) => due,
            _ => {
                warn!(
                    delivery_id = %delivery.id,
                    status = %delivery.status,
                    "Refusing to schedule a delivery that is not retrying"
                );
                return false;
            }
        };

        debug!(
            delivery_id = %delivery.id,
            attempt = delivery.attempt_count,
            next_retry_at = %due,
            "Scheduling retry"
        );
        self.timeline.lock().await.insert(due, delivery)
    }

    pub async fn len(&self) -> usize {
        self.timeline.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.timeline.lock().await.heap.is_empty()
    }

    /// Reload persisted retries due before `before`.
    pub async fn recover(&self, before: OffsetDateTime) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for delivery in self.deliveries.get_due_retries(before).await? {
            if self.schedule(delivery).await {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered scheduled retries");
        }
        Ok(recovered)
    }

    /// Re-enqueue every delivery due at `now`.
    pub async fn tick(&self, now: OffsetDateTime) -> TickReport {
        let due = self.timeline.lock().await.pop_due(now);
        let mut report = TickReport::default();

        for delivery in due {
            let subscription = match self
                .subscriptions
                .get_subscription(delivery.subscription_id)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(
                        delivery_id = %delivery.id,
                        error = %e,
                        "Subscription lookup failed, deferring retry"
                    );
                    self.defer(delivery, now, &mut report).await;
                    continue;
                }
            };

            let reason = match &subscription {
                Some(sub) if sub.enabled => None,
                Some(_) => Some(SUBSCRIPTION_DISABLED),
                None => Some(SUBSCRIPTION_NOT_FOUND),
            };

            if let Some(reason) = reason {
                match self
                    .deliveries
                    .update_status(delivery.id, &DeliveryUpdate::abandoned(reason))
                    .await
                {
                    Ok(_) => {
                        report.abandoned += 1;
                        warn!(
                            delivery_id = %delivery.id,
                            subscription_id = %delivery.subscription_id,
                            reason,
                            "Retry abandoned"
                        );
                    }
                    Err(StoreError::TerminalState(status)) => {
                        debug!(delivery_id = %delivery.id, %status, "Delivery already final");
                    }
                    Err(e) => {
                        error!(delivery_id = %delivery.id, error = %e, "Failed to abandon retry");
                        self.defer(delivery, now, &mut report).await;
                    }
                }
                continue;
            }

            match self.queue.try_push(delivery).await {
                Ok(()) => report.requeued += 1,
                Err(delivery) => {
                    debug!(delivery_id = %delivery.id, "Queue full, retry stays due");
                    self.defer(delivery, now, &mut report).await;
                }
            }
        }

        if report != TickReport::default() {
            debug!(
                requeued = report.requeued,
                abandoned = report.abandoned,
                deferred = report.deferred,
                "Retry scheduler tick"
            );
        }
        report
    }

    async fn defer(&self, delivery: Delivery, due: OffsetDateTime, report: &mut TickReport) {
        self.timeline.lock().await.insert(due, delivery);
        report.deferred += 1;
    }

    /// Tick every `interval` until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.tick(OffsetDateTime::now_utc()).await;
                    }
                }
            }
            debug!("Retry scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory_store::{InMemoryDeliveryStore, InMemorySubscriptionStore};
    use crate::outbound::webhook::delivery_queue::OverflowPolicy;
    use crate::outbound::webhook::schemas::RenderedRequest;
    use crate::outbound::webhook::subscription::Subscription;
    use case_events::Event;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Fixture {
        queue: Arc<DeliveryQueue>,
        deliveries: InMemoryDeliveryStore,
        subscriptions: InMemorySubscriptionStore,
        scheduler: RetryScheduler,
        subscription: Subscription,
    }

    fn fixture(capacity: usize) -> Result<Fixture, Box<dyn std::error::Error>> {
        let queue = Arc::new(DeliveryQueue::new(
            capacity,
            OverflowPolicy::Reject,
            Duration::ZERO,
        ));
        let deliveries = InMemoryDeliveryStore::new();
        let subscriptions = InMemorySubscriptionStore::new();
        let subscription = subscriptions.register(
            Subscription::new(1, "soc", "https://hooks.example.com/in").subscribe_all(),
        )?;
        let scheduler = RetryScheduler::new(
            queue.clone(),
            Arc::new(deliveries.clone()),
            Arc::new(subscriptions.clone()),
        );
        Ok(Fixture {
            queue,
            deliveries,
            subscriptions,
            scheduler,
            subscription,
        })
    }

    /// Persist a delivery that failed its first attempt and waits until `due`.
    async fn retrying(fx: &Fixture, due: OffsetDateTime) -> Result<Delivery, StoreError> {
        let event = Event::new("case.created", json!({}));
        let delivery = Delivery::pending(
            Uuid::new_v4(),
            &fx.subscription,
            &event,
            RenderedRequest {
                url: fx.subscription.url.clone(),
                method: "POST".to_string(),
                headers: BTreeMap::new(),
                body: "{}".to_string(),
            },
        );
        fx.deliveries.create(&delivery).await?;
        fx.deliveries
            .update_status(delivery.id, &DeliveryUpdate::sending(1))
            .await?;
        fx.deliveries
            .update_status(delivery.id, &DeliveryUpdate::failed("HTTP 500", None))
            .await?;
        fx.deliveries
            .update_status(delivery.id, &DeliveryUpdate::retrying(due))
            .await
    }

    #[tokio::test]
    async fn releases_in_due_order() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture(10)?;
        let now = OffsetDateTime::now_utc();
        let later = retrying(&fx, now - time::Duration::seconds(1)).await?;
        let earlier = retrying(&fx, now - time::Duration::seconds(5)).await?;
        let future = retrying(&fx, now + time::Duration::minutes(5)).await?;

        for d in [later.clone(), earlier.clone(), future.clone()] {
            assert!(fx.scheduler.schedule(d).await);
        }

        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.requeued, 2);
        assert_eq!(fx.queue.pop().await.map(|d| d.id), Some(earlier.id));
        assert_eq!(fx.queue.pop().await.map(|d| d.id), Some(later.id));
        assert_eq!(fx.scheduler.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn refuses_non_retrying_and_duplicates() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture(10)?;
        let d = retrying(&fx, OffsetDateTime::now_utc()).await?;

        assert!(fx.scheduler.schedule(d.clone()).await);
        assert!(!fx.scheduler.schedule(d.clone()).await);

        let mut pending = d;
        pending.status = DeliveryStatus::Pending;
        pending.next_retry_at = None;
        pending.id = Uuid::new_v4();
        assert!(!fx.scheduler.schedule(pending).await);
        assert_eq!(fx.scheduler.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_subscription_abandons_at_tick() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture(10)?;
        let now = OffsetDateTime::now_utc();
        let d = retrying(&fx, now).await?;
        fx.scheduler.schedule(d.clone()).await;

        fx.subscriptions.set_enabled(fx.subscription.id, false)?;
        let report = fx.scheduler.tick(now).await;

        assert_eq!(report.abandoned, 1);
        assert!(fx.queue.is_empty().await);
        let stored = fx.deliveries.get(d.id).await?.ok_or("missing delivery")?;
        assert_eq!(stored.status, DeliveryStatus::Abandoned);
        assert_eq!(stored.last_error.as_deref(), Some(SUBSCRIPTION_DISABLED));
        assert_eq!(stored.next_retry_at, None);
        Ok(())
    }

    #[tokio::test]
    async fn full_queue_defers_instead_of_dropping() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture(1)?;
        let now = OffsetDateTime::now_utc();
        let a = retrying(&fx, now).await?;
        let b = retrying(&fx, now).await?;
        fx.scheduler.schedule(a).await;
        fx.scheduler.schedule(b).await;

        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.requeued, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.scheduler.len().await, 1);

        fx.queue.pop().await;
        let report = fx.scheduler.tick(now).await;
        assert_eq!(report.requeued, 1);
        assert!(fx.scheduler.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn recover_loads_persisted_retries() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture(10)?;
        let now = OffsetDateTime::now_utc();
        retrying(&fx, now + time::Duration::seconds(30)).await?;
        retrying(&fx, now + time::Duration::hours(2)).await?;

        let recovered = fx.scheduler.recover(now + time::Duration::hours(1)).await?;
        assert_eq!(recovered, 1);
        assert_eq!(fx.scheduler.tick(now).await, TickReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn periodic_loop_stops_on_cancel() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture(10)?;
        let d = retrying(&fx, OffsetDateTime::now_utc()).await?;
        let scheduler = Arc::new(fx.scheduler);
        scheduler.schedule(d.clone()).await;

        let token = CancellationToken::new();
        let handle = scheduler.clone().spawn(token.clone(), Duration::from_millis(10));

        let popped = tokio::time::timeout(Duration::from_secs(1), fx.queue.pop()).await?;
        assert_eq!(popped.map(|x| x.id), Some(d.id));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await??;
        Ok(())
    }
}
