//! Observe: what kind of utterance is this?

use ontos_protocol::LlmRequest;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::TurnContext;
use crate::gateway::LlmGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceKind {
    Query,
    Action,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    Keywords,
    Llm,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: UtteranceKind,
    pub confidence: f64,
    pub source: ObservationSource,
}

/// Answer to a pending confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Affirm,
    Deny,
}

const HELP_KEYWORDS: &[&str] = &["帮助", "能做什么", "可以做什么", "怎么用", "help", "what can you do"];

const QUERY_KEYWORDS: &[&str] = &[
    "查询", "查看", "查一下", "哪些", "多少", "列出", "有没有", "显示", "show", "list", "how many",
    "which", "?", "？",
];

const AFFIRM: &[&str] = &["是", "是的", "好", "好的", "确认", "确定", "可以", "执行", "yes", "y", "ok", "okay", "confirm"];
const DENY: &[&str] = &["不", "不要", "否", "取消", "算了", "no", "n", "cancel", "abort"];

fn normalized(text: &str) -> String {
    text.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || "。！，".contains(c))
        .to_lowercase()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Yes/no detection for confirmation follow-ups. Anything that is not a
/// short, unambiguous answer returns `None`.
pub fn detect_reply(text: &str) -> Option<Reply> {
    let text = normalized(text);
    if DENY.contains(&text.as_str()) || text.starts_with("取消") {
        return Some(Reply::Deny);
    }
    if AFFIRM.contains(&text.as_str()) || text.starts_with("确认") {
        return Some(Reply::Affirm);
    }
    None
}

/// Keyword heuristics. Never fails: text with no recognised keyword is an
/// action attempt at low confidence.
pub fn classify_by_keywords(text: &str) -> Observation {
    let lowered = text.to_lowercase();
    if contains_any(&lowered, HELP_KEYWORDS) {
        return Observation {
            kind: UtteranceKind::Help,
            confidence: 0.9,
            source: ObservationSource::Keywords,
        };
    }
    if contains_any(&lowered, QUERY_KEYWORDS) {
        return Observation {
            kind: UtteranceKind::Query,
            confidence: 0.8,
            source: ObservationSource::Keywords,
        };
    }
    Observation {
        kind: UtteranceKind::Action,
        confidence: 0.3,
        source: ObservationSource::Default,
    }
}

fn parse_kind(raw: &str) -> Option<UtteranceKind> {
    match raw.trim().to_lowercase().as_str() {
        "query" => Some(UtteranceKind::Query),
        "action" => Some(UtteranceKind::Action),
        "help" => Some(UtteranceKind::Help),
        _ => None,
    }
}

const CLASSIFY_SYSTEM: &str = "Classify the user's message as one of: query (read data), \
action (change data), help (asks what the assistant can do). \
Reply with JSON {\"kind\": \"query|action|help\", \"confidence\": 0..1}.";

/// Classifies an utterance with the LLM when one is configured, keyword
/// heuristics otherwise or when the LLM fails.
pub async fn observe(gateway: &LlmGateway, ctx: &mut TurnContext, text: &str) -> Observation {
    if gateway.is_enabled()
        && let Ok(response) = gateway
            .complete(ctx, LlmRequest::new("classify", CLASSIFY_SYSTEM, text))
            .await
    {
        let parsed = response.structured().and_then(|json| {
            let kind = json.get("kind").and_then(|k| k.as_str()).and_then(parse_kind)?;
            let confidence = json
                .get("confidence")
                .and_then(|c| c.as_f64())
                .unwrap_or(0.7)
                .clamp(0.0, 1.0);
            Some(Observation {
                kind,
                confidence,
                source: ObservationSource::Llm,
            })
        });
        match parsed {
            Some(observation) => return observation,
            None => ctx.mark_unparsable("classify", "missing or unknown kind"),
        }
    }
    let observation = classify_by_keywords(text);
    debug!(kind = ?observation.kind, source = ?observation.source, "utterance classified");
    observation
}
