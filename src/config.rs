use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, builder::DefaultState};
use serde::{Deserialize, Serialize};

use crate::outbound::webhook::delivery_queue::OverflowPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub webhooks: WebhookSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Delivery engine settings as they appear in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub overflow_policy: OverflowPolicy,
    pub retry_tick_ms: u64,
    pub backoff_cap_secs: u64,
    pub jitter_ratio: f64,
    pub shutdown_grace_secs: u64,
    pub user_agent: String,
}

/// Typed runtime form of [`WebhookSettings`] consumed by the engine.
#[derive(Debug, Clone)]
pub struct WebhookEngineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub overflow_policy: OverflowPolicy,
    pub retry_tick: Duration,
    pub backoff_cap: Duration,
    pub jitter_ratio: f64,
    pub shutdown_grace: Duration,
    pub user_agent: String,
}

pub fn default_user_agent() -> String {
    format!("CHawk-Webhook/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for WebhookEngineConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 1000,
            enqueue_timeout: Duration::from_millis(250),
            overflow_policy: OverflowPolicy::Block,
            retry_tick: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(3600),
            jitter_ratio: 0.1,
            shutdown_grace: Duration::from_secs(30),
            user_agent: default_user_agent(),
        }
    }
}

impl From<&WebhookSettings> for WebhookEngineConfig {
    fn from(settings: &WebhookSettings) -> Self {
        Self {
            workers: settings.workers.max(1),
            queue_capacity: settings.queue_capacity.max(1),
            enqueue_timeout: Duration::from_millis(settings.enqueue_timeout_ms),
            overflow_policy: settings.overflow_policy,
            retry_tick: Duration::from_millis(settings.retry_tick_ms.max(1)),
            backoff_cap: Duration::from_secs(settings.backoff_cap_secs),
            jitter_ratio: settings.jitter_ratio,
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_secs),
            user_agent: settings.user_agent.clone(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    fn load_with_sources(env_vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;
        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Should be in the format APP_SERVER__PORT or APP_WEBHOOKS__WORKERS
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Set default values for the configuration.
    /// This is used when no environment variables or config file are provided
    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let engine = WebhookEngineConfig::default();
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .set_default("webhooks.workers", engine.workers as u64)?
            .set_default("webhooks.queue_capacity", engine.queue_capacity as u64)?
            .set_default("webhooks.enqueue_timeout_ms", 250)?
            .set_default("webhooks.overflow_policy", "block")?
            .set_default("webhooks.retry_tick_ms", 10_000)?
            .set_default("webhooks.backoff_cap_secs", 3600)?
            .set_default("webhooks.jitter_ratio", engine.jitter_ratio)?
            .set_default("webhooks.shutdown_grace_secs", 30)?
            .set_default("webhooks.user_agent", engine.user_agent)
    }

    pub fn engine(&self) -> WebhookEngineConfig {
        WebhookEngineConfig::from(&self.webhooks)
    }
}
