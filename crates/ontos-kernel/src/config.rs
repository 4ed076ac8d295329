use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ontos_policy::ConfirmationPolicyConfig;
use ontos_snapshot::DEFAULT_SNAPSHOT_TTL_SECS;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Process-wide settings. Every field has a default so a partial JSON file
/// (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub snapshot_ttl_secs: i64,
    pub llm_timeout_ms: u64,
    pub notification_timeout_ms: u64,
    pub min_intent_confidence: f64,
    pub discovery_top_k: usize,
    pub max_relationship_hops: usize,
    pub query_limit: usize,
    pub confirmation_policy: ConfirmationPolicyConfig,
    /// JSONL audit trail; in-memory when unset.
    pub audit_log_path: Option<PathBuf>,
    /// Registers the webhook notification channel when set.
    pub webhook_url: Option<String>,
    pub event_buffer: usize,
    /// Interval of the built-in expired-snapshot purge job; 0 disables it.
    pub snapshot_purge_interval_secs: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: DEFAULT_SNAPSHOT_TTL_SECS,
            llm_timeout_ms: 8_000,
            notification_timeout_ms: 5_000,
            min_intent_confidence: 0.5,
            discovery_top_k: 5,
            max_relationship_hops: 4,
            query_limit: 50,
            confirmation_policy: ConfirmationPolicyConfig::default(),
            audit_log_path: None,
            webhook_url: None,
            event_buffer: 256,
            snapshot_purge_interval_secs: 3_600,
        }
    }
}

fn env_override<T: std::str::FromStr>(name: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(name) else { return };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => warn!(variable = name, value = %raw, "ignoring unparsable environment override"),
    }
}

impl KernelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// File (when given) then `ONTOS_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        env_override("ONTOS_LLM_TIMEOUT_MS", &mut self.llm_timeout_ms);
        env_override("ONTOS_NOTIFICATION_TIMEOUT_MS", &mut self.notification_timeout_ms);
        env_override("ONTOS_SNAPSHOT_TTL_SECS", &mut self.snapshot_ttl_secs);
        if let Ok(path) = std::env::var("ONTOS_AUDIT_LOG") {
            self.audit_log_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("ONTOS_WEBHOOK_URL") {
            self.webhook_url = Some(url);
        }
    }
}
