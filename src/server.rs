mod handlers;
mod responses;

use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::{Config, WebhookEngineConfig};
use crate::infrastructure::memory_store::{InMemoryDeliveryStore, InMemorySubscriptionStore};
use crate::outbound::webhook::WebhookManager;
use crate::server::handlers::deliveries::get_delivery;
use crate::server::handlers::events::publish_event;
use crate::server::handlers::health::health_check;
use crate::server::handlers::webhooks::{
    create_webhook, delete_webhook, disable_webhook, enable_webhook, get_webhook,
    list_webhook_deliveries, list_webhooks,
};
use axum::http::Method;
use axum::{
    Router,
    routing::{get, post},
};
use color_eyre::eyre::{Context, Result};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[derive(Clone)]
/// The global application state shared between all request handlers.
pub struct AppState {
    pub manager: Arc<WebhookManager>,
    pub subscriptions: InMemorySubscriptionStore,
}

impl AppState {
    /// State backed by the in-memory stores. The engine is not started.
    pub fn in_memory(engine: WebhookEngineConfig) -> Self {
        let subscriptions = InMemorySubscriptionStore::new();
        let manager = WebhookManager::new(
            engine,
            Arc::new(InMemoryDeliveryStore::new()),
            Arc::new(subscriptions.clone()),
        );
        Self {
            manager: Arc::new(manager),
            subscriptions,
        }
    }
}

pub struct Server {
    router: Router,
    listener: TcpListener,
    state: AppState,
}

impl Server {
    /// Starts the delivery engine and binds the HTTP listener.
    pub async fn new(config: &Config) -> Result<Self> {
        let state = AppState::in_memory(config.engine());
        state
            .manager
            .start()
            .await
            .wrap_err("Failed to start the webhook engine")?;

        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ]);

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/webhooks", post(create_webhook).get(list_webhooks))
            .route("/webhooks/{id}", get(get_webhook).delete(delete_webhook))
            .route("/webhooks/{id}/enable", post(enable_webhook))
            .route("/webhooks/{id}/disable", post(disable_webhook))
            .route("/webhooks/{id}/deliveries", get(list_webhook_deliveries))
            .route("/deliveries/{id}", get(get_delivery))
            .route("/events", post(publish_event))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state.clone());

        let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await
            .wrap_err_with(|| format!("Failed to bind to port {}", config.server.port))?;

        Ok(Self {
            router,
            listener,
            state,
        })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Serves until Ctrl+C, then drains the delivery engine.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Server listening on {}", self.listener.local_addr()?);
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Shutting down webhook engine");
        self.state.manager.stop().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
