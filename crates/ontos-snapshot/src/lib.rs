//! Operation snapshots and undo.
//!
//! A snapshot is written into the `_snapshots` system table of the same
//! transaction as the mutation it describes, so either both commit or
//! neither does. Undo re-applies before-images in a fresh transaction after
//! checking that every touched row still matches its captured after-image.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ontos_protocol::{
    EntityStore, OntosError, OntosResult, OperationSnapshot, Row, RowChange, RowFilter,
    SnapshotId, StoreTransaction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

pub const SNAPSHOT_TABLE: &str = "_snapshots";
pub const DEFAULT_SNAPSHOT_TTL_SECS: i64 = 86_400;

/// Who and what a captured snapshot is about.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub operation_type: String,
    pub operator_id: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
}

impl CaptureRequest {
    pub fn new(operation_type: impl Into<String>, operator_id: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            operator_id: operator_id.into(),
            entity_type: None,
            entity_id: None,
        }
    }

    pub fn about(mut self, entity_type: Option<String>, entity_id: Option<String>) -> Self {
        self.entity_type = entity_type;
        self.entity_id = entity_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoOutcome {
    /// Snapshots reversed, in the order they were undone.
    pub undone: Vec<SnapshotId>,
    pub restored: Vec<RowChange>,
}

fn row_digest(row: Option<&Row>) -> OntosResult<Option<String>> {
    row.map(|r| {
        let payload =
            serde_json::to_vec(r).map_err(|e| OntosError::Internal(format!("row digest: {e}")))?;
        Ok(hex::encode(Sha256::digest(payload)))
    })
    .transpose()
}

fn to_row(snapshot: &OperationSnapshot) -> OntosResult<Row> {
    let mut row = match serde_json::to_value(snapshot) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(OntosError::Internal("snapshot did not serialize to an object".into())),
        Err(e) => return Err(OntosError::Internal(format!("snapshot encode: {e}"))),
    };
    row.insert("id".into(), Value::String(snapshot.snapshot_id.to_string()));
    Ok(row)
}

fn from_row(row: Row) -> OntosResult<OperationSnapshot> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| OntosError::Store(format!("corrupt snapshot row: {e}")))
}

#[derive(Clone)]
pub struct SnapshotStore {
    store: Arc<dyn EntityStore>,
    ttl: Duration,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn EntityStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn with_default_ttl(store: Arc<dyn EntityStore>) -> Self {
        Self::new(store, Duration::seconds(DEFAULT_SNAPSHOT_TTL_SECS))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records `changes` as a snapshot inside `tx`. Nothing is persisted
    /// until the caller commits.
    pub fn capture(
        &self,
        tx: &mut dyn StoreTransaction,
        request: CaptureRequest,
        changes: Vec<RowChange>,
        now: DateTime<Utc>,
    ) -> OntosResult<OperationSnapshot> {
        let snapshot = OperationSnapshot {
            snapshot_id: SnapshotId::new_uuid(),
            operation_type: request.operation_type,
            operator_id: request.operator_id,
            created_at: now,
            entity_type: request.entity_type,
            entity_id: request.entity_id,
            changes,
            related_snapshots: Vec::new(),
            undone: false,
            undone_by: None,
            undone_at: None,
            expires_at: now + self.ttl,
        };
        tx.insert(SNAPSHOT_TABLE, to_row(&snapshot)?)?;
        debug!(
            snapshot_id = %snapshot.snapshot_id,
            operation = %snapshot.operation_type,
            rows = snapshot.changes.len(),
            "snapshot captured"
        );
        Ok(snapshot)
    }

    fn load(&self, tx: &dyn StoreTransaction, id: &SnapshotId) -> OntosResult<OperationSnapshot> {
        let row = tx
            .get(SNAPSHOT_TABLE, id.as_str())?
            .ok_or_else(|| OntosError::SnapshotNotFound(id.to_string()))?;
        from_row(row)
    }

    pub fn get(&self, id: &SnapshotId) -> OntosResult<OperationSnapshot> {
        let row = self
            .store
            .get(SNAPSHOT_TABLE, id.as_str())?
            .ok_or_else(|| OntosError::SnapshotNotFound(id.to_string()))?;
        from_row(row)
    }

    /// Snapshots whose primary target is `entity_type`/`entity_id`, newest first.
    pub fn list_for_entity(&self, entity_type: &str, entity_id: &str) -> OntosResult<Vec<OperationSnapshot>> {
        let filters = [
            RowFilter::eq("entity_type", entity_type),
            RowFilter::eq("entity_id", entity_id),
        ];
        let mut snapshots = self
            .store
            .query(SNAPSHOT_TABLE, &filters)?
            .into_iter()
            .map(from_row)
            .collect::<OntosResult<Vec<_>>>()?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    pub fn list_recent(&self, limit: usize) -> OntosResult<Vec<OperationSnapshot>> {
        let mut snapshots = self
            .store
            .query(SNAPSHOT_TABLE, &[])?
            .into_iter()
            .map(from_row)
            .collect::<OntosResult<Vec<_>>>()?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots.truncate(limit);
        Ok(snapshots)
    }

    /// Makes every snapshot in `ids` list all the others as related, so an
    /// undo of any of them can cascade across the group.
    pub fn link_related(&self, ids: &[SnapshotId]) -> OntosResult<()> {
        if ids.len() < 2 {
            return Ok(());
        }
        let mut tx = self.store.begin();
        for id in ids {
            let mut snapshot = self.load(tx.as_ref(), id)?;
            for other in ids.iter().filter(|other| *other != id) {
                if !snapshot.related_snapshots.contains(other) {
                    snapshot.related_snapshots.push(other.clone());
                }
            }
            tx.put(SNAPSHOT_TABLE, to_row(&snapshot)?)?;
        }
        tx.commit()?;
        debug!(count = ids.len(), "snapshots linked");
        Ok(())
    }

    fn check_undoable(snapshot: &OperationSnapshot, now: DateTime<Utc>) -> OntosResult<()> {
        if snapshot.undone {
            return Err(OntosError::SnapshotAlreadyUndone(snapshot.snapshot_id.to_string()));
        }
        if snapshot.is_expired(now) {
            return Err(OntosError::SnapshotExpired {
                snapshot_id: snapshot.snapshot_id.to_string(),
                expired_at: snapshot.expires_at,
            });
        }
        Ok(())
    }

    /// Re-applies the before-images of `snapshot` in reverse change order.
    fn revert(
        tx: &mut dyn StoreTransaction,
        snapshot: &OperationSnapshot,
        restored: &mut Vec<RowChange>,
    ) -> OntosResult<()> {
        for change in snapshot.changes.iter().rev() {
            let current = tx.get(&change.entity, &change.id)?;
            if row_digest(current.as_ref())? != row_digest(change.after.as_ref())? {
                warn!(
                    snapshot_id = %snapshot.snapshot_id,
                    entity = %change.entity,
                    id = %change.id,
                    "row diverged since snapshot"
                );
                return Err(OntosError::UndoConflict {
                    snapshot_id: snapshot.snapshot_id.to_string(),
                    reason: format!("{} {} changed after the operation", change.entity, change.id),
                });
            }
            match &change.before {
                Some(before) => tx.put(&change.entity, before.clone())?,
                None => {
                    tx.delete(&change.entity, &change.id)?;
                }
            }
            restored.push(RowChange {
                entity: change.entity.clone(),
                id: change.id.clone(),
                before: current,
                after: change.before.clone(),
            });
        }
        Ok(())
    }

    fn undo_all(
        &self,
        mut tx: Box<dyn StoreTransaction>,
        snapshots: Vec<OperationSnapshot>,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> OntosResult<UndoOutcome> {
        let mut outcome = UndoOutcome {
            undone: Vec::with_capacity(snapshots.len()),
            restored: Vec::new(),
        };
        for mut snapshot in snapshots {
            Self::revert(tx.as_mut(), &snapshot, &mut outcome.restored)?;
            snapshot.undone = true;
            snapshot.undone_by = Some(operator_id.to_owned());
            snapshot.undone_at = Some(now);
            tx.put(SNAPSHOT_TABLE, to_row(&snapshot)?)?;
            outcome.undone.push(snapshot.snapshot_id);
        }
        tx.commit()?;
        Ok(outcome)
    }

    #[instrument(skip(self), fields(snapshot_id = %id, operator = %operator_id))]
    pub fn undo(&self, id: &SnapshotId, operator_id: &str, now: DateTime<Utc>) -> OntosResult<UndoOutcome> {
        let tx = self.store.begin();
        let snapshot = self.load(tx.as_ref(), id)?;
        Self::check_undoable(&snapshot, now)?;
        let outcome = self.undo_all(tx, vec![snapshot], operator_id, now)?;
        info!(rows = outcome.restored.len(), "snapshot undone");
        Ok(outcome)
    }

    /// Undoes `id` and every snapshot reachable through `related_snapshots`,
    /// newest first, in one transaction. Related snapshots that were already
    /// undone are skipped; any other refusal aborts the whole cascade.
    #[instrument(skip(self), fields(snapshot_id = %id, operator = %operator_id))]
    pub fn undo_cascade(&self, id: &SnapshotId, operator_id: &str, now: DateTime<Utc>) -> OntosResult<UndoOutcome> {
        let tx = self.store.begin();
        let root = self.load(tx.as_ref(), id)?;
        Self::check_undoable(&root, now)?;

        let mut seen: HashSet<SnapshotId> = HashSet::from([root.snapshot_id.clone()]);
        let mut frontier = root.related_snapshots.clone();
        let mut group = vec![root];
        while let Some(next) = frontier.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let snapshot = self.load(tx.as_ref(), &next)?;
            frontier.extend(snapshot.related_snapshots.iter().cloned());
            if snapshot.undone {
                continue;
            }
            Self::check_undoable(&snapshot, now)?;
            group.push(snapshot);
        }
        group.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let outcome = self.undo_all(tx, group, operator_id, now)?;
        info!(snapshots = outcome.undone.len(), rows = outcome.restored.len(), "cascade undone");
        Ok(outcome)
    }

    /// The snapshot and every snapshot reachable through its links.
    pub fn linked_group(&self, id: &SnapshotId) -> OntosResult<Vec<OperationSnapshot>> {
        let tx = self.store.begin();
        let root = self.load(tx.as_ref(), id)?;
        let mut seen: HashSet<SnapshotId> = HashSet::from([root.snapshot_id.clone()]);
        let mut frontier = root.related_snapshots.clone();
        let mut group = vec![root];
        while let Some(next) = frontier.pop() {
            if seen.insert(next.clone()) {
                let snapshot = self.load(tx.as_ref(), &next)?;
                frontier.extend(snapshot.related_snapshots.iter().cloned());
                group.push(snapshot);
            }
        }
        Ok(group)
    }

    /// Deletes snapshots past their expiry. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> OntosResult<usize> {
        let mut tx = self.store.begin();
        let mut purged = 0;
        for row in tx.query(SNAPSHOT_TABLE, &[])? {
            let snapshot = from_row(row)?;
            if snapshot.is_expired(now) {
                tx.delete(SNAPSHOT_TABLE, snapshot.snapshot_id.as_str())?;
                purged += 1;
            }
        }
        tx.commit()?;
        if purged > 0 {
            info!(purged, "expired snapshots purged");
        }
        Ok(purged)
    }
}
