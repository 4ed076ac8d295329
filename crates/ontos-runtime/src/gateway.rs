use std::sync::Arc;
use std::time::{Duration, Instant};

use ontos_protocol::{LlmPort, LlmRequest, LlmResponse, OntosError, OntosResult};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::context::{LlmCallOutcome, TurnContext};

/// Timeout-bounded access to the optional LLM capability. Every call is
/// recorded on the turn context; every failure comes back as
/// `UpstreamUnavailable` so callers fall back to rules.
#[derive(Clone)]
pub struct LlmGateway {
    port: Option<Arc<dyn LlmPort>>,
    timeout: Duration,
}

impl LlmGateway {
    pub fn new(port: Option<Arc<dyn LlmPort>>, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_millis(0))
    }

    pub fn is_enabled(&self) -> bool {
        self.port.is_some()
    }

    #[instrument(skip(self, ctx, request), fields(turn_id = %ctx.turn_id, kind = %request.kind))]
    pub async fn complete(&self, ctx: &mut TurnContext, request: LlmRequest) -> OntosResult<LlmResponse> {
        let Some(port) = &self.port else {
            return Err(OntosError::upstream("llm", "no LLM configured"));
        };
        let kind = request.kind.clone();
        let started = Instant::now();
        let outcome = match timeout(self.timeout, port.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(OntosError::upstream(
                "llm",
                format!("timed out after {}ms", self.timeout.as_millis()),
            )),
        };
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(response) => {
                debug!(latency_ms, model = %response.model, "llm call completed");
                ctx.record_llm_call(kind, latency_ms, LlmCallOutcome::Ok);
                Ok(response)
            }
            Err(error) => {
                warn!(latency_ms, %error, "llm call failed");
                ctx.record_llm_call(kind, latency_ms, LlmCallOutcome::Unavailable(error.to_string()));
                Err(match error {
                    OntosError::UpstreamUnavailable { .. } => error,
                    other => OntosError::upstream("llm", other.to_string()),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    use super::*;

    /// Replays canned structured responses in order; errors once exhausted.
    pub struct ScriptedLlm {
        responses: Mutex<VecDeque<Value>>,
        pub requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: impl IntoIterator<Item = Value>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmPort for ScriptedLlm {
        async fn complete(&self, request: LlmRequest) -> OntosResult<LlmResponse> {
            self.requests.lock().push(request);
            let next = self.responses.lock().pop_front();
            next.map(|json| LlmResponse {
                text: json.to_string(),
                json: Some(json),
                model: "scripted".into(),
            })
            .ok_or_else(|| OntosError::upstream("llm", "script exhausted"))
        }
    }

    pub struct StalledLlm;

    #[async_trait]
    impl LlmPort for StalledLlm {
        async fn complete(&self, _request: LlmRequest) -> OntosResult<LlmResponse> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Err(OntosError::Internal("unreachable".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::context::SessionContext;
    use ontos_protocol::UserContext;

    fn turn() -> TurnContext {
        TurnContext::new(&SessionContext::new("s1", UserContext::new("u1", "receptionist")))
    }

    #[tokio::test]
    async fn stalled_llm_times_out_and_is_recorded() {
        let gateway = LlmGateway::new(Some(Arc::new(StalledLlm)), Duration::from_millis(20));
        let mut ctx = turn();
        let err = gateway
            .complete(&mut ctx, LlmRequest::new("intent", "sys", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
        assert_eq!(ctx.llm_calls.len(), 1);
        assert!(matches!(ctx.llm_calls[0].outcome, LlmCallOutcome::Unavailable(_)));
    }

    #[tokio::test]
    async fn disabled_gateway_reports_unavailable_without_recording() {
        let mut ctx = turn();
        let err = LlmGateway::disabled()
            .complete(&mut ctx, LlmRequest::new("classify", "sys", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UPSTREAM_UNAVAILABLE");
        assert!(ctx.llm_calls.is_empty());
    }
}
