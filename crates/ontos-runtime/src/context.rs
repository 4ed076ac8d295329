//! Per-turn context passed by reference through the whole loop.

use std::time::Instant;

use chrono::{DateTime, Utc};
use ontos_protocol::{ActionContext, SessionId, TurnId, UserContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum LlmCallOutcome {
    Ok,
    Unavailable(String),
    Unparsable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCallRecord {
    /// `classify`, `intent`, ...
    pub kind: String,
    pub latency_ms: u64,
    pub outcome: LlmCallOutcome,
}

/// Identity of the conversation a turn belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user: UserContext,
}

impl SessionContext {
    pub fn new(session_id: impl Into<SessionId>, user: UserContext) -> Self {
        Self {
            session_id: session_id.into(),
            user,
        }
    }
}

#[derive(Debug)]
pub struct TurnContext {
    pub turn_id: TurnId,
    pub session_id: SessionId,
    pub user: UserContext,
    pub started_at: DateTime<Utc>,
    pub llm_calls: Vec<LlmCallRecord>,
    clock: Instant,
}

impl TurnContext {
    pub fn new(session: &SessionContext) -> Self {
        Self {
            turn_id: TurnId::new_uuid(),
            session_id: session.session_id.clone(),
            user: session.user.clone(),
            started_at: Utc::now(),
            llm_calls: Vec::new(),
            clock: Instant::now(),
        }
    }

    pub fn record_llm_call(&mut self, kind: impl Into<String>, latency_ms: u64, outcome: LlmCallOutcome) {
        self.llm_calls.push(LlmCallRecord {
            kind: kind.into(),
            latency_ms,
            outcome,
        });
    }

    /// Marks the most recent LLM call of `kind` as returning unusable output.
    pub fn mark_unparsable(&mut self, kind: &str, reason: impl Into<String>) {
        if let Some(call) = self.llm_calls.iter_mut().rev().find(|c| c.kind == kind) {
            call.outcome = LlmCallOutcome::Unparsable(reason.into());
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub fn action_context(&self) -> ActionContext {
        ActionContext::new(self.user.clone())
            .in_session(self.session_id.clone())
            .in_turn(self.turn_id.clone())
    }
}
