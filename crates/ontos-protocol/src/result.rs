//! Outcome of a single action invocation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FieldError, OntosError};
use crate::ids::SnapshotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: ChangeType,
}

impl AffectedEntity {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            change_type,
        }
    }
}

/// Constructed once per invocation and not mutated after dispatch returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub affected: Vec<AffectedEntity>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_alternatives: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            entity_type: None,
            entity_id: None,
            data: Map::new(),
            affected: Vec::new(),
            events: Vec::new(),
            error_code: None,
            valid_alternatives: Vec::new(),
            suggestion: None,
            field_errors: Vec::new(),
            snapshot_id: None,
        }
    }

    /// Failed result carrying the error's code, alternatives and suggestion.
    pub fn failure(error: &OntosError) -> Self {
        let mut result = Self::ok(error.to_string());
        result.success = false;
        result.error_code = Some(error.error_code().to_owned());
        result.valid_alternatives = error.valid_alternatives().to_vec();
        result.suggestion = error.suggestion().map(str::to_owned);
        result.field_errors = error.field_errors().to_vec();
        result
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn affects(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        self.affected
            .push(AffectedEntity::new(entity_type, entity_id, change_type));
        self
    }

    pub fn emit(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    /// String field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failure_carries_code_and_alternatives() {
        let err = OntosError::InvalidTransition {
            entity: "Room".into(),
            from: "vacant_dirty".into(),
            trigger: "check_in".into(),
            valid_alternatives: vec!["clean".into()],
        };
        let result = ActionResult::failure(&err);
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("INVALID_TRANSITION"));
        assert_eq!(result.valid_alternatives, vec!["clean".to_string()]);
    }

    #[test]
    fn builder_accumulates_effects() {
        let result = ActionResult::ok("入住成功")
            .with_entity("StayRecord", "S1")
            .with_data("bill_id", json!("B1"))
            .affects("Room", "101", ChangeType::Updated)
            .emit("GUEST_CHECKED_IN");
        assert_eq!(result.data_str("bill_id"), Some("B1"));
        assert_eq!(result.affected.len(), 1);
        assert_eq!(result.events, vec!["GUEST_CHECKED_IN".to_string()]);
    }
}
