//! Before/after state records that make a mutation reversible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::SnapshotId;

/// A stored entity row. Every row carries a string `id`.
pub type Row = Map<String, Value>;

/// One touched row inside a transaction. `before == None` means the row was
/// created; `after == None` means it was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub entity: String,
    pub id: String,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub snapshot_id: SnapshotId,
    /// Action name that produced the mutation.
    pub operation_type: String,
    pub operator_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub changes: Vec<RowChange>,
    #[serde(default)]
    pub related_snapshots: Vec<SnapshotId>,
    #[serde(default)]
    pub undone: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undone_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undone_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl OperationSnapshot {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// `{entity: {id: row}}` view of the state before the mutation.
    pub fn before_state(&self) -> Value {
        Self::state_view(self.changes.iter().map(|c| (c, c.before.as_ref())))
    }

    pub fn after_state(&self) -> Value {
        Self::state_view(self.changes.iter().map(|c| (c, c.after.as_ref())))
    }

    fn state_view<'a>(rows: impl Iterator<Item = (&'a RowChange, Option<&'a Row>)>) -> Value {
        let mut by_entity = Map::new();
        for (change, row) in rows {
            let slot = by_entity
                .entry(change.entity.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ids) = slot {
                ids.insert(
                    change.id.clone(),
                    row.cloned().map_or(Value::Null, Value::Object),
                );
            }
        }
        Value::Object(by_entity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn state_views_group_rows_by_entity() {
        let now = Utc::now();
        let snapshot = OperationSnapshot {
            snapshot_id: SnapshotId::from("s1"),
            operation_type: "walkin_checkin".into(),
            operator_id: "u1".into(),
            created_at: now,
            entity_type: Some("StayRecord".into()),
            entity_id: Some("S1".into()),
            changes: vec![
                RowChange {
                    entity: "Room".into(),
                    id: "R1".into(),
                    before: Some(row(json!({"id": "R1", "status": "vacant_clean"}))),
                    after: Some(row(json!({"id": "R1", "status": "occupied"}))),
                },
                RowChange {
                    entity: "StayRecord".into(),
                    id: "S1".into(),
                    before: None,
                    after: Some(row(json!({"id": "S1", "status": "active"}))),
                },
            ],
            related_snapshots: vec![],
            undone: false,
            undone_by: None,
            undone_at: None,
            expires_at: now + Duration::hours(24),
        };

        let before = snapshot.before_state();
        assert_eq!(before["Room"]["R1"]["status"], "vacant_clean");
        assert!(before["StayRecord"]["S1"].is_null());
        assert_eq!(snapshot.after_state()["StayRecord"]["S1"]["status"], "active");
        assert!(!snapshot.is_expired(now));
        assert!(snapshot.is_expired(now + Duration::hours(25)));
    }
}
