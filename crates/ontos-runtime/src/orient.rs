//! Orient: turn text into an intent against the registered actions.
//!
//! Strategies sit behind [`IntentStrategy`] so the loop does not care whether
//! an LLM or keyword rules produced the intent. An intent below the loop's
//! confidence floor is treated as unrecognised.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ontos_actions::{ActionRegistry, Params, SearchHit, missing_required};
use ontos_protocol::{ActionMetadata, LlmRequest, OntosError, OntosResult};
use ontos_registry::OntologyRegistry;
use ontos_rules::Vocabulary;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::TurnContext;
use crate::gateway::LlmGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Rules,
    Llm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub action_type: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    pub source: IntentSource,
    /// Shortlist the intent was chosen from, best first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<SearchHit>,
}

impl Intent {
    pub fn unrecognised(source: IntentSource) -> Self {
        Self {
            action_type: None,
            confidence: 0.0,
            params: Params::new(),
            missing_fields: Vec::new(),
            source,
            candidates: Vec::new(),
        }
    }

    pub fn is_usable(&self, min_confidence: f64) -> bool {
        self.action_type.is_some() && self.confidence >= min_confidence
    }
}

#[async_trait]
pub trait IntentStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, ctx: &mut TurnContext, text: &str) -> OntosResult<Intent>;
}

/// Pulls declared parameters out of free text: `extract` regex patterns
/// first (first capture group, or the whole match), then vocabulary terms and
/// literal enum values for enum parameters.
pub struct ParamExtractor {
    vocabulary: Arc<Vocabulary>,
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl ParamExtractor {
    pub fn new(vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            vocabulary,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    fn capture(&self, pattern: &str, text: &str) -> Option<String> {
        let mut cache = self.patterns.lock();
        let regex = cache.entry(pattern.to_owned()).or_insert_with(|| {
            Regex::new(pattern)
                .map_err(|error| warn!(%pattern, %error, "invalid extract pattern ignored"))
                .ok()
        });
        let captures = regex.as_ref()?.captures(text)?;
        let found = captures.get(1).or_else(|| captures.get(0))?;
        Some(found.as_str().trim().to_owned()).filter(|s| !s.is_empty())
    }

    pub fn extract(&self, action: &ActionMetadata, text: &str) -> Params {
        let lowered = text.to_lowercase();
        let mut params = Params::new();
        for spec in &action.params {
            let captured = spec.extract_patterns.iter().find_map(|p| self.capture(p, text));
            let value = match captured {
                Some(raw) if !spec.enum_values.is_empty() => self
                    .vocabulary
                    .resolve_alias(&action.entity, &spec.name, &raw)
                    .map(str::to_owned)
                    .or(Some(raw)),
                Some(raw) => Some(raw),
                None if !spec.enum_values.is_empty() => self.enum_from_text(action, &spec.name, &spec.enum_values, &lowered),
                None => None,
            };
            if let Some(value) = value {
                params.insert(spec.name.clone(), Value::String(value));
            }
        }
        params
    }

    fn enum_from_text(&self, action: &ActionMetadata, field: &str, allowed: &[String], lowered: &str) -> Option<String> {
        let from_vocabulary = self
            .vocabulary
            .find_terms(&action.entity, lowered)
            .into_iter()
            .find(|m| m.field == field && m.values.len() == 1)
            .and_then(|m| m.values.into_iter().next());
        from_vocabulary.or_else(|| {
            allowed
                .iter()
                .filter(|v| lowered.contains(&v.to_lowercase()))
                .max_by_key(|v| v.len())
                .cloned()
        })
    }
}

/// Keyword discovery plus pattern extraction; no network.
pub struct RuleIntentStrategy {
    actions: Arc<ActionRegistry>,
    extractor: ParamExtractor,
    top_k: usize,
}

impl RuleIntentStrategy {
    pub fn new(actions: Arc<ActionRegistry>, vocabulary: Arc<Vocabulary>, top_k: usize) -> Self {
        Self {
            actions,
            extractor: ParamExtractor::new(vocabulary),
            top_k: top_k.max(1),
        }
    }

    pub fn extractor(&self) -> &ParamExtractor {
        &self.extractor
    }

    fn recognise(&self, role: &str, text: &str) -> Intent {
        let candidates = self.actions.search(text, self.top_k, Some(role));
        let Some(best) = candidates.first() else {
            return Intent::unrecognised(IntentSource::Rules);
        };
        let Some(meta) = self.actions.metadata(&best.action) else {
            return Intent::unrecognised(IntentSource::Rules);
        };
        let mut confidence = best.score / (best.score + 2.0);
        if candidates.get(1).is_some_and(|second| second.score == best.score) {
            confidence *= 0.8;
        }
        let params = self.extractor.extract(meta, text);
        let missing_fields = missing_required(meta, &params);
        Intent {
            action_type: Some(meta.name.clone()),
            confidence,
            params,
            missing_fields,
            source: IntentSource::Rules,
            candidates,
        }
    }
}

#[async_trait]
impl IntentStrategy for RuleIntentStrategy {
    fn name(&self) -> &str {
        "rules"
    }

    async fn extract(&self, ctx: &mut TurnContext, text: &str) -> OntosResult<Intent> {
        let intent = self.recognise(&ctx.user.role, text);
        debug!(action = ?intent.action_type, confidence = intent.confidence, "rule intent");
        Ok(intent)
    }
}

const INTENT_SYSTEM: &str = "You map a user's request to exactly one of the registered actions below. \
Reply with JSON {\"action\": \"<action name or null>\", \"confidence\": 0..1, \"params\": {...}}. \
Only use parameter names the action declares. Use null when nothing fits.";

pub struct LlmIntentStrategy {
    gateway: LlmGateway,
    actions: Arc<ActionRegistry>,
    schema: String,
}

impl LlmIntentStrategy {
    pub fn new(gateway: LlmGateway, actions: Arc<ActionRegistry>, registry: &OntologyRegistry) -> Self {
        Self {
            gateway,
            actions,
            schema: registry.describe_for_prompt(),
        }
    }

    fn parse(&self, json: &Value) -> Result<Intent, String> {
        let object = json.as_object().ok_or("intent is not an object")?;
        let action = match object.get("action") {
            None | Some(Value::Null) => return Ok(Intent::unrecognised(IntentSource::Llm)),
            Some(Value::String(name)) => name.as_str(),
            Some(_) => return Err("action is not a string".into()),
        };
        let meta = self
            .actions
            .metadata(action)
            .ok_or_else(|| format!("unknown action {action}"))?;
        let confidence = object
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        let params: Params = object
            .get("params")
            .and_then(Value::as_object)
            .map(|p| p.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let missing_fields = missing_required(meta, &params);
        Ok(Intent {
            action_type: Some(meta.name.clone()),
            confidence,
            params,
            missing_fields,
            source: IntentSource::Llm,
            candidates: Vec::new(),
        })
    }
}

#[async_trait]
impl IntentStrategy for LlmIntentStrategy {
    fn name(&self) -> &str {
        "llm"
    }

    async fn extract(&self, ctx: &mut TurnContext, text: &str) -> OntosResult<Intent> {
        let mut request = LlmRequest::new("intent", INTENT_SYSTEM, text);
        request.params = serde_json::json!({ "schema": self.schema, "role": ctx.user.role });
        let response = self.gateway.complete(ctx, request).await?;
        let parsed = response
            .structured()
            .ok_or_else(|| "response is not JSON".to_owned())
            .and_then(|json| self.parse(&json));
        parsed.map_err(|reason| {
            ctx.mark_unparsable("intent", reason.clone());
            OntosError::upstream("llm", format!("unparsable intent: {reason}"))
        })
    }
}

/// LLM first; keyword rules when the LLM is unavailable or talks nonsense.
pub struct FallbackIntentStrategy {
    primary: LlmIntentStrategy,
    fallback: RuleIntentStrategy,
}

impl FallbackIntentStrategy {
    pub fn new(primary: LlmIntentStrategy, fallback: RuleIntentStrategy) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl IntentStrategy for FallbackIntentStrategy {
    fn name(&self) -> &str {
        "llm_with_rules"
    }

    async fn extract(&self, ctx: &mut TurnContext, text: &str) -> OntosResult<Intent> {
        match self.primary.extract(ctx, text).await {
            Err(OntosError::UpstreamUnavailable { reason, .. }) => {
                warn!(%reason, "llm intent unavailable, using rules");
                self.fallback.extract(ctx, text).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::context::{LlmCallOutcome, SessionContext};
    use crate::gateway::testing::ScriptedLlm;
    use ontos_actions::FnAction;
    use ontos_protocol::{ActionResult, ParamSpec, ParamType, UserContext};
    use serde_json::json;

    fn actions() -> Arc<ActionRegistry> {
        let mut registry = ActionRegistry::new();
        let noop = || FnAction::new(|_, _| Ok(ActionResult::ok("ok")));
        let _ = registry.add(
            ActionMetadata::new("checkout", "StayRecord")
                .describe("办理退房 check out")
                .keywords(["退房", "check out"])
                .param(
                    ParamSpec::new("stay_id", ParamType::String)
                        .required()
                        .refers_to("StayRecord", ["room_number"])
                        .extract([r"(\d{3,4})"]),
                ),
            noop(),
        );
        let _ = registry.add(
            ActionMetadata::new("update_room_status", "Room")
                .describe("更新房间状态 room status")
                .keywords(["房态", "打扫"])
                .param(ParamSpec::new("room_id", ParamType::String).required().extract([r"(\d{3,4})"]))
                .param(ParamSpec::new("status", ParamType::String).required().one_of(["vacant_clean", "vacant_dirty"])),
            noop(),
        );
        let _ = registry.add(
            ActionMetadata::new("adjust_bill", "Bill")
                .describe("调整账单")
                .keywords(["调账"])
                .roles(["manager"]),
            noop(),
        );
        Arc::new(registry)
    }

    fn vocabulary() -> Arc<Vocabulary> {
        let mut vocabulary = Vocabulary::new();
        vocabulary.add_alias("Room", "status", "打扫完", "vacant_clean");
        Arc::new(vocabulary)
    }

    fn turn(role: &str) -> TurnContext {
        TurnContext::new(&SessionContext::new("s1", UserContext::new("u1", role)))
    }

    #[tokio::test]
    async fn rules_find_action_and_extract_params() -> anyhow::Result<()> {
        let rules = RuleIntentStrategy::new(actions(), vocabulary(), 5);
        let intent = rules.extract(&mut turn("receptionist"), "帮201退房").await?;
        assert_eq!(intent.action_type.as_deref(), Some("checkout"));
        assert!(intent.is_usable(0.5), "confidence {}", intent.confidence);
        assert_eq!(intent.params["stay_id"], json!("201"));
        assert!(intent.missing_fields.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn enum_params_resolve_through_vocabulary() -> anyhow::Result<()> {
        let rules = RuleIntentStrategy::new(actions(), vocabulary(), 5);
        let intent = rules.extract(&mut turn("cleaner"), "305房态 打扫完了").await?;
        assert_eq!(intent.action_type.as_deref(), Some("update_room_status"));
        assert_eq!(intent.params["status"], json!("vacant_clean"));
        assert_eq!(intent.params["room_id"], json!("305"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_fields_and_role_filtering() -> anyhow::Result<()> {
        let rules = RuleIntentStrategy::new(actions(), vocabulary(), 5);
        let intent = rules.extract(&mut turn("receptionist"), "退房").await?;
        assert_eq!(intent.missing_fields, vec!["stay_id"]);

        let denied = rules.extract(&mut turn("receptionist"), "调账").await?;
        assert!(!denied.is_usable(0.5));
        Ok(())
    }

    #[tokio::test]
    async fn fallback_uses_rules_when_llm_output_is_unusable() -> anyhow::Result<()> {
        let registry = OntologyRegistry::new();
        let llm = ScriptedLlm::new([json!({"action": "teleport", "confidence": 0.9})]);
        let gateway = LlmGateway::new(Some(Arc::new(llm)), Duration::from_secs(1));
        let strategy = FallbackIntentStrategy::new(
            LlmIntentStrategy::new(gateway, actions(), &registry),
            RuleIntentStrategy::new(actions(), vocabulary(), 5),
        );
        let mut ctx = turn("receptionist");
        let intent = strategy.extract(&mut ctx, "帮201退房").await?;
        assert_eq!(intent.source, IntentSource::Rules);
        assert_eq!(intent.action_type.as_deref(), Some("checkout"));
        assert!(matches!(ctx.llm_calls[0].outcome, LlmCallOutcome::Unparsable(_)));
        Ok(())
    }

    #[tokio::test]
    async fn llm_intent_is_taken_when_valid() -> anyhow::Result<()> {
        let registry = OntologyRegistry::new();
        let llm = ScriptedLlm::new([json!({
            "action": "checkout",
            "confidence": 0.92,
            "params": {"stay_id": "S-1", "note": null}
        })]);
        let gateway = LlmGateway::new(Some(Arc::new(llm)), Duration::from_secs(1));
        let strategy = LlmIntentStrategy::new(gateway, actions(), &registry);
        let intent = strategy.extract(&mut turn("receptionist"), "check out the guest").await?;
        assert_eq!(intent.source, IntentSource::Llm);
        assert_eq!(intent.params.get("stay_id"), Some(&json!("S-1")));
        assert!(!intent.params.contains_key("note"));
        Ok(())
    }
}
