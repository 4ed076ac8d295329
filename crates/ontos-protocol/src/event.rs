//! Domain events published after a successful mutation commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::EventId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: EventId,
    /// Upper snake case name, e.g. `GUEST_CHECKED_IN`.
    pub name: String,
    /// Action that produced the event.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub actor_id: String,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(name: impl Into<String>, action: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new_uuid(),
            name: name.into(),
            action: action.into(),
            entity_type: None,
            entity_id: None,
            actor_id: actor_id.into(),
            payload: Value::Null,
            occurred_at: Utc::now(),
        }
    }

    pub fn about(mut self, entity_type: Option<String>, entity_id: Option<String>) -> Self {
        self.entity_type = entity_type;
        self.entity_id = entity_id;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}
