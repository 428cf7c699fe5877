#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chawk_webhooks::config::{Config, WebhookEngineConfig};
use chawk_webhooks::domain::ports::DeliveryStore;
use chawk_webhooks::infrastructure::memory_store::{
    InMemoryDeliveryStore, InMemorySubscriptionStore,
};
use chawk_webhooks::outbound::webhook::{Delivery, WebhookManager};
use chawk_webhooks::server::Server;
use uuid::Uuid;

pub async fn spawn_server() -> String {
    let config = {
        let mut config = Config::load().unwrap();
        config.server.host = "localhost".to_string();
        config.server.port = 0;
        config
    };

    let server = Server::new(&config).await.unwrap();

    let port = server.port().unwrap();
    tokio::spawn(server.run());

    format!("http://{}:{}", config.server.host, port)
}

/// Engine settings with short timings so retries resolve within a test.
pub fn fast_engine() -> WebhookEngineConfig {
    WebhookEngineConfig {
        workers: 2,
        queue_capacity: 16,
        enqueue_timeout: Duration::from_millis(50),
        retry_tick: Duration::from_millis(10),
        backoff_cap: Duration::from_secs(1),
        jitter_ratio: 0.0,
        shutdown_grace: Duration::from_secs(2),
        user_agent: "chawk-webhooks-tests".to_string(),
        ..WebhookEngineConfig::default()
    }
}

pub struct Harness {
    pub manager: WebhookManager,
    pub deliveries: InMemoryDeliveryStore,
    pub subscriptions: InMemorySubscriptionStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_stores(InMemoryDeliveryStore::new(), InMemorySubscriptionStore::new())
    }

    pub fn with_stores(
        deliveries: InMemoryDeliveryStore,
        subscriptions: InMemorySubscriptionStore,
    ) -> Self {
        let manager = WebhookManager::new(
            fast_engine(),
            Arc::new(deliveries.clone()),
            Arc::new(subscriptions.clone()),
        );
        Self {
            manager,
            deliveries,
            subscriptions,
        }
    }

    /// Poll until the delivery reaches a terminal status.
    pub async fn settled(&self, id: Uuid) -> Delivery {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(delivery) = self.deliveries.get(id).await.unwrap()
                && delivery.is_terminal()
            {
                return delivery;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "delivery {id} did not settle in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `check` holds for the delivery.
    pub async fn wait_for(&self, id: Uuid, check: impl Fn(&Delivery) -> bool) -> Delivery {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(delivery) = self.deliveries.get(id).await.unwrap()
                && check(&delivery)
            {
                return delivery;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "delivery {id} never reached the expected state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
