use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ontos_protocol::{AuditRecord, AuditSeverity, OntosError, OntosResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub min_severity: Option<AuditSeverity>,
    #[serde(default)]
    pub only_failures: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.actor_id.as_ref().is_none_or(|a| *a == record.actor_id)
            && self.action.as_ref().is_none_or(|a| *a == record.action)
            && self.min_severity.is_none_or(|s| record.severity >= s)
            && (!self.only_failures || !record.success)
    }

    /// Newest records first, truncated to `limit`.
    fn select(&self, records: impl DoubleEndedIterator<Item = AuditRecord>) -> Vec<AuditRecord> {
        let limit = self.limit.unwrap_or(usize::MAX);
        records.rev().filter(|r| self.matches(r)).take(limit).collect()
    }
}

/// Append-only audit trail. Records are never updated or removed.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> OntosResult<()>;
    async fn query(&self, query: &AuditQuery) -> OntosResult<Vec<AuditRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, record: &AuditRecord) -> OntosResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> OntosResult<Vec<AuditRecord>> {
        let records = self.records.lock().clone();
        Ok(query.select(records.into_iter()))
    }
}

/// One JSON record per line.
#[derive(Debug)]
pub struct FileAuditLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

fn io_error(path: &Path, error: impl std::fmt::Display) -> OntosError {
    OntosError::Store(format!("audit log {}: {error}", path.display()))
}

impl FileAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(&self) -> OntosResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLog for FileAuditLog {
    #[instrument(skip(self, record), fields(action = %record.action, actor = %record.actor_id, success = record.success))]
    async fn append(&self, record: &AuditRecord) -> OntosResult<()> {
        self.ensure_parent().await?;
        let _guard = self.write_lock.lock().await;

        let mut line = serde_json::to_string(record).map_err(|e| io_error(&self.path, e))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_error(&self.path, e))?;
        file.flush().await.map_err(|e| io_error(&self.path, e))?;
        debug!("audit record appended");
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> OntosResult<Vec<AuditRecord>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Some(line) = lines.next_line().await.map_err(|e| io_error(&self.path, e))? {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord =
                serde_json::from_str(&line).map_err(|e| io_error(&self.path, e))?;
            records.push(record);
        }
        Ok(query.select(records.into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use anyhow::Result;
    use ontos_protocol::{ActionResult, OntosError};
    use serde_json::json;

    fn unique_test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir()
            .join(format!("{name}-{nanos}"))
            .join("audit.jsonl")
    }

    fn records() -> Vec<AuditRecord> {
        let ok = ActionResult::ok("done");
        let denied = ActionResult::failure(&OntosError::PermissionDenied {
            role: "receptionist".into(),
            operation: "Bill:adjust_bill".into(),
        });
        vec![
            AuditRecord::from_result("add_payment", "r1", "receptionist", json!({"amount": 10}), &ok),
            AuditRecord::from_result("adjust_bill", "r1", "receptionist", json!({}), &denied),
            AuditRecord::from_result("checkout", "m1", "manager", json!({}), &ok),
        ]
    }

    #[tokio::test]
    async fn memory_log_filters_newest_first() -> Result<()> {
        let log = MemoryAuditLog::new();
        for record in records() {
            log.append(&record).await?;
        }
        let by_r1 = log
            .query(&AuditQuery { actor_id: Some("r1".into()), ..Default::default() })
            .await?;
        assert_eq!(by_r1.len(), 2);
        assert_eq!(by_r1[0].action, "adjust_bill");

        let severe = log
            .query(&AuditQuery { min_severity: Some(AuditSeverity::Error), ..Default::default() })
            .await?;
        assert_eq!(severe.len(), 1);

        let latest = log.query(&AuditQuery { limit: Some(1), ..Default::default() }).await?;
        assert_eq!(latest[0].action, "checkout");
        Ok(())
    }

    #[tokio::test]
    async fn file_log_appends_jsonl() -> Result<()> {
        let path = unique_test_path("ontos-audit");
        let log = FileAuditLog::new(&path);
        assert!(log.query(&AuditQuery::default()).await?.is_empty());
        for record in records() {
            log.append(&record).await?;
        }

        let failures = log
            .query(&AuditQuery { only_failures: true, ..Default::default() })
            .await?;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_code.as_deref(), Some("PERMISSION_DENIED"));

        let raw = fs::read_to_string(&path).await?;
        assert_eq!(raw.lines().count(), 3);

        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir).await;
        }
        Ok(())
    }
}
