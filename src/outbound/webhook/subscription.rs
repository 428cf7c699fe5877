use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::filter::{ALL_EVENTS, FilterError, SubscriptionFilter};
use super::template::{TemplateError, WebhookTemplate};

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 60_000;

/// Why a subscription was refused at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("invalid header name '{0}'")]
    InvalidHeader(String),

    #[error("invalid value for header '{0}'")]
    InvalidHeaderValue(String),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Rolling delivery statistics. The only part of a subscription the
/// delivery engine writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    pub total_sent: u64,
    pub total_failed: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_triggered: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_failure: Option<OffsetDateTime>,
}

/// A registered webhook, owned by one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub organization_id: i64,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Shared signing secret. Never echoed back.
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,

    #[serde(default = "default_true")]
    pub verify_ssl: bool,

    /// Subscribed event kinds; `"*"` means every kind.
    pub events: BTreeSet<String>,

    #[serde(default)]
    pub filter: SubscriptionFilter,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_headers: BTreeMap<String, String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<WebhookTemplate>,

    #[serde(default)]
    pub stats: SubscriptionStats,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

impl Subscription {
    pub fn new(organization_id: i64, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            name: name.into(),
            description: None,
            url: url.into(),
            method: default_method(),
            enabled: true,
            secret: None,
            verify_ssl: true,
            events: BTreeSet::new(),
            filter: SubscriptionFilter::default(),
            custom_headers: BTreeMap::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            template: None,
            stats: SubscriptionStats::default(),
        }
    }

    /// Subscribe to specific event kinds, replacing the current set.
    pub fn subscribe_to<S: Into<String>>(mut self, events: impl IntoIterator<Item = S>) -> Self {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn subscribe_all(self) -> Self {
        self.subscribe_to([ALL_EVENTS])
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_template(mut self, template: WebhookTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn insecure(mut self) -> Self {
        self.verify_ssl = false;
        self
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// The first attempt plus every retry.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn subscribes_to_all(&self) -> bool {
        self.events.contains(ALL_EVENTS)
    }

    /// Registration-time checks. Anything accepted here is safe to dispatch.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        validate_url(&self.url)?;

        if self.method.parse::<Method>().is_err() || self.method.trim().is_empty() {
            return Err(RegistrationError::InvalidMethod(self.method.clone()));
        }

        if self.timeout_ms == 0 {
            return Err(RegistrationError::ZeroTimeout);
        }

        if self.events.is_empty() {
            return Err(FilterError::NoEventTypes.into());
        }
        if self.events.iter().any(|e| e.trim().is_empty()) {
            return Err(FilterError::BlankEventType.into());
        }
        self.filter.validate()?;

        for (name, value) in &self.custom_headers {
            if HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(RegistrationError::InvalidHeader(name.clone()));
            }
            if HeaderValue::from_str(value).is_err() {
                return Err(RegistrationError::InvalidHeaderValue(name.clone()));
            }
        }

        if let Some(template) = &self.template {
            template.validate()?;
            // Values are rendered per event and checked at build time.
            for name in template.headers.keys() {
                if HeaderName::from_bytes(name.as_bytes()).is_err() {
                    return Err(RegistrationError::InvalidHeader(name.clone()));
                }
            }
            if let Some(url) = &template.url
                && !url.contains("{{")
            {
                validate_url(url)?;
            }
            if let Some(method) = &template.method
                && method.parse::<Method>().is_err()
            {
                return Err(RegistrationError::InvalidMethod(method.clone()));
            }
        }

        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), RegistrationError> {
    let invalid = |reason: &str| RegistrationError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => return Err(invalid("scheme must be http or https")),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(())
}
