use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct EventType(pub String);

impl EventType {
    pub const CASE_CREATED: &str = "case.created";
    pub const CASE_UPDATED: &str = "case.updated";
    pub const CASE_CLOSED: &str = "case.closed";
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const OBSERVABLE_CREATED: &str = "observable.created";
    pub const ALERT_CREATED: &str = "alert.created";
    pub const ALERT_IMPORTED: &str = "alert.imported";
    pub const CORTEX_JOB_COMPLETED: &str = "cortex.job.completed";

    /// Every kind the core currently raises.
    pub const ALL: [&str; 9] = [
        Self::CASE_CREATED,
        Self::CASE_UPDATED,
        Self::CASE_CLOSED,
        Self::TASK_CREATED,
        Self::TASK_COMPLETED,
        Self::OBSERVABLE_CREATED,
        Self::ALERT_CREATED,
        Self::ALERT_IMPORTED,
        Self::CORTEX_JOB_COMPLETED,
    ];

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace part of the kind (e.g. "case.created" -> "case").
    pub fn namespace(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifiers of the domain objects an event is about.
///
/// Used for filtering and for linking deliveries back to the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedObjects {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observable_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl RelatedObjects {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Immutable notification of a domain occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<i64>,
    #[serde(default)]
    pub related: RelatedObjects,
    /// Structured description of the affected domain object.
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: impl Into<EventType>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            timestamp: OffsetDateTime::now_utc(),
            organization_id: None,
            triggered_by: None,
            related: RelatedObjects::default(),
            payload,
        }
    }

    pub fn with_organization(mut self, organization_id: i64) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_triggered_by(mut self, user_id: i64) -> Self {
        self.triggered_by = Some(user_id);
        self
    }

    pub fn with_related(mut self, related: RelatedObjects) -> Self {
        self.related = related;
        self
    }

    pub fn with_case(mut self, case_id: i64) -> Self {
        self.related.case_id = Some(case_id);
        self
    }

    pub fn with_task(mut self, task_id: i64) -> Self {
        self.related.task_id = Some(task_id);
        self
    }

    /// Pin the timestamp, mostly useful for reproducible payloads.
    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> &str {
        self.event_type.as_str()
    }
}
