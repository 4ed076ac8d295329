//! Append-only audit records covering every dispatch attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AuditId, SnapshotId};
use crate::result::ActionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: AuditId,
    pub action: String,
    pub actor_id: String,
    pub role: String,
    #[serde(default)]
    pub params: Value,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub severity: AuditSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    /// Severity follows the outcome: success is `info`, business rejections
    /// are `warning`, authorization failures are `error`.
    pub fn from_result(
        action: impl Into<String>,
        actor_id: impl Into<String>,
        role: impl Into<String>,
        params: Value,
        result: &ActionResult,
    ) -> Self {
        let severity = match result.error_code.as_deref() {
            None => AuditSeverity::Info,
            Some("PERMISSION_DENIED" | "ATTRIBUTE_ACCESS_DENIED") => AuditSeverity::Error,
            Some(_) => AuditSeverity::Warning,
        };
        Self {
            audit_id: AuditId::new_uuid(),
            action: action.into(),
            actor_id: actor_id.into(),
            role: role.into(),
            params,
            success: result.success,
            message: result.message.clone(),
            error_code: result.error_code.clone(),
            severity,
            entity_type: result.entity_type.clone(),
            entity_id: result.entity_id.clone(),
            snapshot_id: result.snapshot_id.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Record for a failure that never produced an `ActionResult`.
    pub fn infrastructure_failure(
        action: impl Into<String>,
        actor_id: impl Into<String>,
        role: impl Into<String>,
        params: Value,
        message: impl Into<String>,
        error_code: &str,
    ) -> Self {
        Self {
            audit_id: AuditId::new_uuid(),
            action: action.into(),
            actor_id: actor_id.into(),
            role: role.into(),
            params,
            success: false,
            message: message.into(),
            error_code: Some(error_code.to_owned()),
            severity: AuditSeverity::Critical,
            entity_type: None,
            entity_id: None,
            snapshot_id: None,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OntosError;

    #[test]
    fn severity_tracks_outcome() {
        let ok = ActionResult::ok("done");
        let record = AuditRecord::from_result("checkout", "u1", "receptionist", Value::Null, &ok);
        assert_eq!(record.severity, AuditSeverity::Info);

        let denied = ActionResult::failure(&OntosError::PermissionDenied {
            role: "receptionist".into(),
            operation: "Bill:adjust_bill".into(),
        });
        let record = AuditRecord::from_result("adjust_bill", "u1", "receptionist", Value::Null, &denied);
        assert_eq!(record.severity, AuditSeverity::Error);
        assert!(!record.success);
    }
}
