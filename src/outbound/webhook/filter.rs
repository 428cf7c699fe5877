use case_events::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

use super::subscription::Subscription;

/// Wildcard accepted in a subscription's event set.
pub const ALL_EVENTS: &str = "*";

/// Malformed filter configuration, rejected when a subscription is registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("subscription must list at least one event type")]
    NoEventTypes,

    #[error("blank event type in subscription")]
    BlankEventType,

    #[error("filter must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error("unknown filter dimension '{0}'")]
    UnknownDimension(String),

    #[error("filter dimension '{dimension}' must be an array")]
    NotAnArray { dimension: String },

    #[error("filter dimension '{dimension}' contains an invalid entry: {value}")]
    InvalidEntry { dimension: String, value: String },
}

/// Domain filter criteria of a subscription.
///
/// Every set is optional: an empty set never excludes an event. Status,
/// severity and tag criteria only apply when the event payload carries
/// that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub organizations: BTreeSet<i64>,

    #[serde(default, rename = "status", skip_serializing_if = "BTreeSet::is_empty")]
    pub statuses: BTreeSet<String>,

    #[serde(default, rename = "severity", skip_serializing_if = "BTreeSet::is_empty")]
    pub severities: BTreeSet<String>,

    #[serde(default, rename = "tags", skip_serializing_if = "BTreeSet::is_empty")]
    pub required_tags: BTreeSet<String>,
}

impl SubscriptionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organizations(mut self, organizations: impl IntoIterator<Item = i64>) -> Self {
        self.organizations = organizations.into_iter().collect();
        self
    }

    pub fn with_statuses<S: Into<String>>(mut self, statuses: impl IntoIterator<Item = S>) -> Self {
        self.statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_severities<S: Into<String>>(
        mut self,
        severities: impl IntoIterator<Item = S>,
    ) -> Self {
        self.severities = severities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.organizations.is_empty()
            && self.statuses.is_empty()
            && self.severities.is_empty()
            && self.required_tags.is_empty()
    }

    /// Parse the JSON filter column used by the configuration store.
    ///
    /// Accepted shape: `{"organizations": [1, 2], "status": ["Open"],
    /// "severity": [2, 3], "tags": ["critical"]}`. `null` means no filter.
    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => return Err(FilterError::NotAnObject(json_kind(other).to_string())),
        };

        let mut filter = Self::default();
        for (dimension, entries) in object {
            let items = entries.as_array().ok_or_else(|| FilterError::NotAnArray {
                dimension: dimension.clone(),
            })?;

            match dimension.as_str() {
                "organizations" | "organization" => {
                    for item in items {
                        let id = item.as_i64().ok_or_else(|| FilterError::InvalidEntry {
                            dimension: dimension.clone(),
                            value: item.to_string(),
                        })?;
                        filter.organizations.insert(id);
                    }
                }
                "status" | "severity" | "tags" => {
                    for item in items {
                        let entry =
                            scalar_to_string(item).ok_or_else(|| FilterError::InvalidEntry {
                                dimension: dimension.clone(),
                                value: item.to_string(),
                            })?;
                        let set = match dimension.as_str() {
                            "status" => &mut filter.statuses,
                            "severity" => &mut filter.severities,
                            _ => &mut filter.required_tags,
                        };
                        set.insert(entry);
                    }
                }
                other => return Err(FilterError::UnknownDimension(other.to_string())),
            }
        }

        filter.validate()?;
        Ok(filter)
    }

    /// Reject blank entries, which could never match anything meaningful.
    pub fn validate(&self) -> Result<(), FilterError> {
        for (dimension, set) in [
            ("status", &self.statuses),
            ("severity", &self.severities),
            ("tags", &self.required_tags),
        ] {
            if let Some(blank) = set.iter().find(|v| v.trim().is_empty()) {
                return Err(FilterError::InvalidEntry {
                    dimension: dimension.to_string(),
                    value: format!("{blank:?}"),
                });
            }
        }
        Ok(())
    }
}

/// Decide whether `subscription` should receive `event`.
///
/// Checks run in a fixed order: enabled flag, subscribed kinds,
/// organization scope, then the payload-dependent domain filters.
pub fn matches(subscription: &Subscription, event: &Event) -> bool {
    if !subscription.enabled {
        return false;
    }

    if !subscribes_to(subscription, event.kind()) {
        return false;
    }

    let filter = &subscription.filter;

    if !filter.organizations.is_empty() {
        match event_organization(event) {
            Some(org) if filter.organizations.contains(&org) => {}
            _ => return false,
        }
    }

    let subject = filter_subject(&event.payload);

    if !filter.statuses.is_empty()
        && let Some(status) = subject.get("status").and_then(scalar_to_string)
        && !filter.statuses.contains(&status)
    {
        return false;
    }

    if !filter.severities.is_empty()
        && let Some(severity) = subject.get("severity").and_then(scalar_to_string)
        && !filter.severities.contains(&severity)
    {
        return false;
    }

    if !filter.required_tags.is_empty()
        && let Some(tags) = subject.get("tags").and_then(Value::as_array)
    {
        let has_overlap = tags
            .iter()
            .filter_map(Value::as_str)
            .any(|tag| filter.required_tags.contains(tag));
        if !has_overlap {
            return false;
        }
    }

    true
}

fn subscribes_to(subscription: &Subscription, kind: &str) -> bool {
    subscription.events.contains(kind) || subscription.events.contains(ALL_EVENTS)
}

/// Organization of an event: the explicit field, else `payload.organization.id`.
pub fn event_organization(event: &Event) -> Option<i64> {
    event.organization_id.or_else(|| {
        event
            .payload
            .get("organization")
            .and_then(|org| org.get("id"))
            .and_then(Value::as_i64)
    })
}

/// Case events nest their object under `case`; everything else is read
/// from the payload root.
fn filter_subject(payload: &Value) -> &Value {
    match payload.get("case") {
        Some(case) if case.is_object() => case,
        _ => payload,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
