//! Capability ports consumed by the action core.
//!
//! These traits are the only boundary between the core and its external
//! collaborators: the relational store, the LLM, notification channels and the
//! job scheduler. Implementations live in other crates (or in the host app).
//!
//! Object-safety note:
//! - Async ports use `async-trait` for dyn dispatch.
//! - The store port is synchronous; a transaction is a plain owned object.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OntosError, OntosResult};
use crate::ids::JobId;
use crate::snapshot::{Row, RowChange};

/// Tables whose name starts with this prefix belong to the core (snapshots)
/// and are excluded from change capture.
pub const SYSTEM_TABLE_PREFIX: &str = "_";

pub fn row_id(row: &Row) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

/// Equality that tolerates numeric representation and number/string mixes,
/// so `"101"` matches `101` and `1` matches `1.0`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowFilter {
    Eq { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Contains { field: String, needle: String },
}

impl RowFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Eq { field, .. } | Self::In { field, .. } | Self::Contains { field, .. } => field,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Self::Eq { value, .. } => loose_eq(actual, value),
            Self::In { values, .. } => values.iter().any(|v| loose_eq(actual, v)),
            Self::Contains { needle, .. } => match actual {
                Value::String(s) => s.to_lowercase().contains(&needle.to_lowercase()),
                Value::Null => false,
                other => other.to_string().contains(needle.as_str()),
            },
        }
    }
}

/// One unit of work against the relational store.
///
/// Reads observe the transaction's own writes. Nothing is visible to other
/// transactions until `commit`; dropping without commit discards the writes.
pub trait StoreTransaction: Send {
    fn get(&self, entity: &str, id: &str) -> OntosResult<Option<Row>>;
    fn query(&self, entity: &str, filters: &[RowFilter]) -> OntosResult<Vec<Row>>;
    /// Inserts a row, assigning a fresh `id` when the row has none.
    fn insert(&mut self, entity: &str, row: Row) -> OntosResult<String>;
    /// Merges `patch` into an existing row and returns the merged row.
    fn update(&mut self, entity: &str, id: &str, patch: Row) -> OntosResult<Row>;
    /// Replaces (or recreates) a row wholesale.
    fn put(&mut self, entity: &str, row: Row) -> OntosResult<()>;
    fn delete(&mut self, entity: &str, id: &str) -> OntosResult<Option<Row>>;
    /// Every non-system row touched so far, with its committed before-image.
    fn changes(&self) -> Vec<RowChange>;
    fn commit(self: Box<Self>) -> OntosResult<()>;

    fn require(&self, entity: &str, id: &str) -> OntosResult<Row> {
        self.get(entity, id)?
            .ok_or_else(|| OntosError::not_found(entity, id))
    }
}

pub trait EntityStore: Send + Sync {
    fn begin(&self) -> Box<dyn StoreTransaction>;

    fn get(&self, entity: &str, id: &str) -> OntosResult<Option<Row>> {
        self.begin().get(entity, id)
    }

    fn query(&self, entity: &str, filters: &[RowFilter]) -> OntosResult<Vec<Row>> {
        self.begin().query(entity, filters)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// What the call is for (`classify`, `intent`, `plan`); used for tracing.
    pub kind: String,
    pub system: String,
    pub prompt: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub json_mode: bool,
}

impl LlmRequest {
    pub fn new(kind: impl Into<String>, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            system: system.into(),
            prompt: prompt.into(),
            params: Value::Null,
            json_mode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    #[serde(default)]
    pub model: String,
}

impl LlmResponse {
    /// Structured payload, parsing `text` when no JSON was attached.
    pub fn structured(&self) -> Option<Value> {
        self.json
            .clone()
            .or_else(|| serde_json::from_str(self.text.trim()).ok())
    }
}

/// Unavailability must be reported as `OntosError::UpstreamUnavailable` so
/// callers can degrade to rule-based handling.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> OntosResult<LlmResponse>;
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        content: &str,
        extra: &Value,
    ) -> OntosResult<bool>;
}

pub type JobFuture = BoxFuture<'static, OntosResult<()>>;
pub type JobTask = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub description: String,
}

impl JobSpec {
    pub fn every(name: impl Into<String>, interval_secs: u64) -> Self {
        Self {
            name: name.into(),
            interval_secs,
            description: String::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub name: String,
    pub interval_secs: u64,
    pub paused: bool,
    pub run_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[async_trait]
pub trait SchedulerPort: Send + Sync {
    async fn add_job(&self, spec: JobSpec, task: JobTask) -> OntosResult<JobId>;
    async fn remove_job(&self, job_id: &JobId) -> OntosResult<()>;
    async fn pause_job(&self, job_id: &JobId) -> OntosResult<()>;
    async fn resume_job(&self, job_id: &JobId) -> OntosResult<()>;
    async fn get_jobs(&self) -> Vec<JobInfo>;
    /// Runs the job now, regardless of its pause state.
    async fn trigger_job(&self, job_id: &JobId) -> OntosResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn filters_compare_loosely() {
        let room = row(json!({"id": "R1", "number": 101, "status": "vacant_clean"}));
        assert!(RowFilter::eq("number", "101").matches(&room));
        assert!(RowFilter::one_of("status", vec![json!("vacant_clean"), json!("vacant_dirty")]).matches(&room));
        assert!(!RowFilter::eq("status", "occupied").matches(&room));
    }

    #[test]
    fn contains_is_case_insensitive() {
        let guest = row(json!({"id": "G1", "name": "Alice Wong"}));
        assert!(RowFilter::contains("name", "alice").matches(&guest));
        assert!(!RowFilter::contains("phone", "138").matches(&guest));
    }

    #[test]
    fn structured_response_falls_back_to_text() {
        let response = LlmResponse {
            text: r#"{"kind": "query"}"#.into(),
            json: None,
            model: "test".into(),
        };
        assert_eq!(response.structured().unwrap()["kind"], "query");
    }
}
