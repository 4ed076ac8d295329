//! Human-in-the-loop confirmation: which actions need an explicit "yes", and
//! the queue of actions waiting for one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ontos_protocol::{ActionMetadata, ConfirmationId, RiskLevel, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

/// Decides whether an action invocation must be confirmed before it runs.
pub trait ConfirmationPolicy: Send + Sync {
    /// `Some(reason)` when confirmation is required.
    fn requires_confirmation(&self, action: &ActionMetadata, params: &Value) -> Option<String>;
}

fn flagged(action: &ActionMetadata) -> Option<String> {
    action
        .requires_confirmation
        .then(|| format!("{} 需要确认", action.name))
}

/// Confirm exactly the actions flagged `requires_confirmation`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConfirm;

impl ConfirmationPolicy for AlwaysConfirm {
    fn requires_confirmation(&self, action: &ActionMetadata, _params: &Value) -> Option<String> {
        flagged(action)
    }
}

/// Flagged actions plus any action at or above `min_risk`.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmByRisk {
    pub min_risk: RiskLevel,
}

impl ConfirmationPolicy for ConfirmByRisk {
    fn requires_confirmation(&self, action: &ActionMetadata, _params: &Value) -> Option<String> {
        flagged(action).or_else(|| {
            (action.risk >= self.min_risk).then(|| format!("{} 风险等级为 {:?}", action.name, action.risk))
        })
    }
}

/// Flagged actions plus any action whose numeric `param` exceeds `threshold`.
#[derive(Debug, Clone)]
pub struct ConfirmByThreshold {
    pub param: String,
    pub threshold: f64,
}

impl ConfirmationPolicy for ConfirmByThreshold {
    fn requires_confirmation(&self, action: &ActionMetadata, params: &Value) -> Option<String> {
        flagged(action).or_else(|| {
            let value = params.get(&self.param).and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })?;
            (value > self.threshold)
                .then(|| format!("{} 超过阈值 {}", self.param, self.threshold))
        })
    }
}

/// Requires confirmation when any member policy does.
#[derive(Default)]
pub struct CompositePolicy {
    policies: Vec<Box<dyn ConfirmationPolicy>>,
}

impl CompositePolicy {
    pub fn new(policies: Vec<Box<dyn ConfirmationPolicy>>) -> Self {
        Self { policies }
    }
}

impl ConfirmationPolicy for CompositePolicy {
    fn requires_confirmation(&self, action: &ActionMetadata, params: &Value) -> Option<String> {
        self.policies
            .iter()
            .find_map(|p| p.requires_confirmation(action, params))
    }
}

/// Startup-time selection of the confirmation policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfirmationPolicyConfig {
    #[default]
    Always,
    ByRisk { min_risk: RiskLevel },
    ByThreshold { param: String, threshold: f64 },
    Composite { policies: Vec<ConfirmationPolicyConfig> },
}

impl ConfirmationPolicyConfig {
    pub fn build(&self) -> Box<dyn ConfirmationPolicy> {
        match self {
            Self::Always => Box::new(AlwaysConfirm),
            Self::ByRisk { min_risk } => Box::new(ConfirmByRisk { min_risk: *min_risk }),
            Self::ByThreshold { param, threshold } => Box::new(ConfirmByThreshold {
                param: param.clone(),
                threshold: *threshold,
            }),
            Self::Composite { policies } => {
                Box::new(CompositePolicy::new(policies.iter().map(Self::build).collect()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub confirmation_id: ConfirmationId,
    pub session_id: SessionId,
    pub action: String,
    pub params: Value,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResolution {
    pub confirmation_id: ConfirmationId,
    pub approved: bool,
    pub actor: String,
    pub resolved_at: DateTime<Utc>,
}

/// Actions awaiting a yes/no, keyed by session. At most one per session: a
/// newer request replaces the older one.
#[derive(Debug, Clone)]
pub struct PendingConfirmations {
    ttl: Duration,
    pending: Arc<RwLock<HashMap<SessionId, PendingConfirmation>>>,
    resolved: Arc<RwLock<HashMap<ConfirmationId, ConfirmationResolution>>>,
}

impl Default for PendingConfirmations {
    fn default() -> Self {
        Self::new(Duration::minutes(10))
    }
}

impl PendingConfirmations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Arc::new(RwLock::new(HashMap::new())),
            resolved: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn enqueue(
        &self,
        session_id: SessionId,
        action: impl Into<String>,
        params: Value,
        reason: impl Into<String>,
    ) -> PendingConfirmation {
        let created_at = Utc::now();
        let pending = PendingConfirmation {
            confirmation_id: ConfirmationId::new_uuid(),
            session_id: session_id.clone(),
            action: action.into(),
            params,
            reason: reason.into(),
            created_at,
            expires_at: created_at + self.ttl,
        };
        debug!(session_id = %session_id, action = %pending.action, "confirmation requested");
        self.pending.write().await.insert(session_id, pending.clone());
        pending
    }

    /// The live pending confirmation for the session, if any.
    pub async fn pending_for_session(&self, session_id: &SessionId) -> Option<PendingConfirmation> {
        self.pending
            .read()
            .await
            .get(session_id)
            .filter(|p| p.expires_at > Utc::now())
            .cloned()
    }

    /// Removes the session's pending confirmation and records the decision.
    /// Expired confirmations resolve to `None`.
    pub async fn resolve(
        &self,
        session_id: &SessionId,
        approved: bool,
        actor: impl Into<String>,
    ) -> Option<(PendingConfirmation, ConfirmationResolution)> {
        let pending = self.pending.write().await.remove(session_id)?;
        if pending.expires_at <= Utc::now() {
            debug!(session_id = %session_id, action = %pending.action, "confirmation expired");
            return None;
        }
        let resolution = ConfirmationResolution {
            confirmation_id: pending.confirmation_id.clone(),
            approved,
            actor: actor.into(),
            resolved_at: Utc::now(),
        };
        self.resolved
            .write()
            .await
            .insert(pending.confirmation_id.clone(), resolution.clone());
        Some((pending, resolution))
    }

    pub async fn resolution(&self, id: &ConfirmationId) -> Option<ConfirmationResolution> {
        self.resolved.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment() -> ActionMetadata {
        ActionMetadata::new("add_payment", "Bill").risk(RiskLevel::Medium)
    }

    #[test]
    fn policies_compose() {
        let flagged_action = ActionMetadata::new("adjust_bill", "Bill").confirm();
        assert!(AlwaysConfirm.requires_confirmation(&flagged_action, &Value::Null).is_some());
        assert!(AlwaysConfirm.requires_confirmation(&payment(), &Value::Null).is_none());

        let by_risk = ConfirmByRisk { min_risk: RiskLevel::Medium };
        assert!(by_risk.requires_confirmation(&payment(), &Value::Null).is_some());

        let by_amount = ConfirmByThreshold { param: "amount".into(), threshold: 1000.0 };
        assert!(by_amount.requires_confirmation(&payment(), &json!({"amount": 500})).is_none());
        assert!(by_amount.requires_confirmation(&payment(), &json!({"amount": "1500"})).is_some());

        let config = ConfirmationPolicyConfig::Composite {
            policies: vec![
                ConfirmationPolicyConfig::Always,
                ConfirmationPolicyConfig::ByThreshold { param: "amount".into(), threshold: 1000.0 },
            ],
        };
        let composite = config.build();
        assert!(composite.requires_confirmation(&payment(), &json!({"amount": 2000})).is_some());
        assert!(composite.requires_confirmation(&payment(), &json!({"amount": 20})).is_none());
    }

    #[test]
    fn config_deserializes_from_tagged_json() {
        let config: ConfirmationPolicyConfig =
            serde_json::from_value(json!({"kind": "by_risk", "min_risk": "high"})).expect("valid config");
        assert_eq!(config, ConfirmationPolicyConfig::ByRisk { min_risk: RiskLevel::High });
    }

    #[tokio::test]
    async fn queue_resolves_once_per_session() {
        let queue = PendingConfirmations::default();
        let session = SessionId::from("front-desk");
        queue.enqueue(session.clone(), "checkout", json!({"stay_record_id": "S1"}), "confirm").await;
        assert!(queue.pending_for_session(&session).await.is_some());

        let (pending, resolution) = queue.resolve(&session, true, "r1").await.expect("pending");
        assert_eq!(pending.action, "checkout");
        assert!(resolution.approved);
        assert!(queue.resolve(&session, true, "r1").await.is_none());
        assert!(queue.resolution(&pending.confirmation_id).await.is_some());
    }

    #[tokio::test]
    async fn expired_confirmation_cannot_be_approved() {
        let queue = PendingConfirmations::new(Duration::seconds(-1));
        let session = SessionId::from("s");
        queue.enqueue(session.clone(), "checkout", Value::Null, "confirm").await;
        assert!(queue.pending_for_session(&session).await.is_none());
        assert!(queue.resolve(&session, true, "r1").await.is_none());
    }
}
