use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::ports::{DeliveryStore, StoreError, SubscriptionStore};
use crate::outbound::webhook::schemas::{Delivery, DeliveryStatus, DeliveryUpdate};
use crate::outbound::webhook::subscription::{RegistrationError, Subscription, SubscriptionStats};

fn lock<'a, T>(mutex: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::Poisoned(format!("{name} lock poisoned: {e}")))
}

// ============================================================================
// InMemoryDeliveryStore
// ============================================================================
#[derive(Debug, Default, Clone)]
pub struct InMemoryDeliveryStore {
    deliveries: Arc<Mutex<HashMap<Uuid, Delivery>>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored deliveries, oldest first.
    pub fn snapshot(&self) -> Result<Vec<Delivery>, StoreError> {
        let mut all: Vec<Delivery> = lock(&self.deliveries, "InMemoryDeliveryStore")?
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|d| d.created_at);
        Ok(all)
    }

    fn select(&self, keep: impl Fn(&Delivery) -> bool) -> Result<Vec<Delivery>, StoreError> {
        let mut selected: Vec<Delivery> = lock(&self.deliveries, "InMemoryDeliveryStore")?
            .values()
            .filter(|d| keep(d))
            .cloned()
            .collect();
        selected.sort_by_key(|d| d.created_at);
        Ok(selected)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError> {
        let mut deliveries = lock(&self.deliveries, "InMemoryDeliveryStore")?;
        if deliveries.contains_key(&delivery.id) {
            return Err(StoreError::AlreadyExists {
                kind: "delivery",
                id: delivery.id,
            });
        }
        deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        update: &DeliveryUpdate,
    ) -> Result<Delivery, StoreError> {
        let mut deliveries = lock(&self.deliveries, "InMemoryDeliveryStore")?;
        let delivery = deliveries
            .get_mut(&id)
            .ok_or_else(|| StoreError::delivery_not_found(id))?;
        delivery.apply(update)?;
        Ok(delivery.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
        Ok(lock(&self.deliveries, "InMemoryDeliveryStore")?
            .get(&id)
            .cloned())
    }

    async fn get_due_retries(&self, before: OffsetDateTime) -> Result<Vec<Delivery>, StoreError> {
        self.select(|d| {
            d.status == DeliveryStatus::Retrying && d.next_retry_at.is_some_and(|at| at <= before)
        })
    }

    async fn get_pending(&self) -> Result<Vec<Delivery>, StoreError> {
        self.select(|d| {
            matches!(
                d.status,
                DeliveryStatus::Pending | DeliveryStatus::Sending | DeliveryStatus::Failed
            )
        })
    }

    async fn list_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<Delivery>, StoreError> {
        self.select(|d| d.subscription_id == subscription_id)
    }
}

// ============================================================================
// InMemorySubscriptionStore
// ============================================================================
#[derive(Debug, Default, Clone)]
pub struct InMemorySubscriptionStore {
    subscriptions: Arc<Mutex<HashMap<Uuid, Subscription>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error(transparent)]
    Invalid(#[from] RegistrationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a subscription. Statistics start from zero.
    pub fn register(&self, mut subscription: Subscription) -> Result<Subscription, RegisterError> {
        subscription.validate()?;
        subscription.stats = SubscriptionStats::default();

        let mut subscriptions = lock(&self.subscriptions, "InMemorySubscriptionStore")?;
        if subscriptions.contains_key(&subscription.id) {
            return Err(StoreError::AlreadyExists {
                kind: "subscription",
                id: subscription.id,
            }
            .into());
        }
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let mut subscriptions = lock(&self.subscriptions, "InMemorySubscriptionStore")?;
        let subscription = subscriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::subscription_not_found(id))?;
        subscription.enabled = enabled;
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(lock(&self.subscriptions, "InMemorySubscriptionStore")?.remove(&id))
    }

    pub fn list(&self) -> Result<Vec<Subscription>, StoreError> {
        let mut all: Vec<Subscription> = lock(&self.subscriptions, "InMemorySubscriptionStore")?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    fn update_stats(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut SubscriptionStats),
    ) -> Result<(), StoreError> {
        let mut subscriptions = lock(&self.subscriptions, "InMemorySubscriptionStore")?;
        let subscription = subscriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::subscription_not_found(id))?;
        apply(&mut subscription.stats);
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_subscription(&self, id: Uuid) -> Result<Option<Subscription>, StoreError> {
        Ok(lock(&self.subscriptions, "InMemorySubscriptionStore")?
            .get(&id)
            .cloned())
    }

    async fn list_for_organization(
        &self,
        organization_id: i64,
    ) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.organization_id == organization_id)
            .collect())
    }

    async fn record_attempt(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        self.update_stats(id, |stats| stats.last_triggered = Some(at))
    }

    async fn record_success(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        self.update_stats(id, |stats| {
            stats.total_sent += 1;
            stats.last_success = Some(at);
        })
    }

    async fn record_failure(&self, id: Uuid, at: OffsetDateTime) -> Result<(), StoreError> {
        self.update_stats(id, |stats| {
            stats.total_failed += 1;
            stats.last_failure = Some(at);
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
