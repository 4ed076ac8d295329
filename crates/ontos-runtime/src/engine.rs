use std::sync::Arc;

use ontos_actions::{Dispatcher, Params};
use ontos_policy::{AlwaysConfirm, ConfirmationPolicy, PendingConfirmation, PendingConfirmations};
use ontos_protocol::{ActionMetadata, ActionResult, OntosError, OntosResult, TurnId};
use ontos_rules::Vocabulary;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::act::{PlanOutcome, execute_plan};
use crate::context::{LlmCallRecord, SessionContext, TurnContext};
use crate::decide::{Clarification, ExecutionPlan, PlanLibrary, PlanTemplate, Resolution, resolve_references};
use crate::gateway::LlmGateway;
use crate::observe::{Observation, Reply, UtteranceKind, detect_reply, observe};
use crate::orient::{Intent, IntentSource, IntentStrategy, ParamExtractor};
use crate::query::{QueryResult, detect_entity, run_query};

/// Pending confirmations for whole plans are stored under this action prefix.
const PLAN_PREFIX: &str = "plan:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Intents below this confidence are treated as unrecognised.
    pub min_intent_confidence: f64,
    pub query_limit: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            min_intent_confidence: 0.5,
            query_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Help,
    Query,
    Action,
    Plan,
    Clarification,
    Confirmation,
    Cancelled,
    Unrecognized,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default)]
    pub llm_calls: Vec<LlmCallRecord>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub turn_id: TurnId,
    pub kind: TurnKind,
    pub message: String,
    #[serde(default)]
    pub results: Vec<ActionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<PendingConfirmation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryResult>,
    #[serde(default)]
    pub trace: TurnTrace,
}

impl TurnResponse {
    fn new(ctx: &TurnContext, kind: TurnKind, message: impl Into<String>) -> Self {
        Self {
            turn_id: ctx.turn_id.clone(),
            kind,
            message: message.into(),
            results: Vec::new(),
            clarification: None,
            confirmation: None,
            plan: None,
            query: None,
            trace: TurnTrace::default(),
        }
    }

    fn clarify(ctx: &TurnContext, clarification: Clarification) -> Self {
        let mut response = Self::new(ctx, TurnKind::Clarification, clarification.question.clone());
        response.clarification = Some(clarification);
        response
    }

    fn from_result(ctx: &TurnContext, result: ActionResult) -> Self {
        let mut message = result.message.clone();
        if let Some(suggestion) = &result.suggestion {
            message.push_str(&format!("（建议: {suggestion}）"));
        }
        if !result.valid_alternatives.is_empty() {
            message.push_str(&format!("（可选操作: {}）", result.valid_alternatives.join(", ")));
        }
        let mut response = Self::new(ctx, TurnKind::Action, message);
        response.results.push(result);
        response
    }

    fn from_plan(ctx: &TurnContext, outcome: PlanOutcome) -> Self {
        let mut response = Self::new(ctx, TurnKind::Plan, outcome.summary());
        response.results = outcome.results();
        response.clarification = outcome.clarification.clone();
        response.plan = Some(outcome);
        response
    }
}

/// One conversational turn: observe, orient, decide, act.
///
/// Nothing here outlives the turn except pending confirmations, which wait
/// for the session's next utterance.
#[derive(Clone)]
pub struct OodaLoop {
    dispatcher: Dispatcher,
    gateway: LlmGateway,
    strategy: Arc<dyn IntentStrategy>,
    extractor: Arc<ParamExtractor>,
    vocabulary: Arc<Vocabulary>,
    plans: Arc<PlanLibrary>,
    confirmation: Arc<dyn ConfirmationPolicy>,
    pending: PendingConfirmations,
    config: LoopConfig,
}

impl OodaLoop {
    pub fn new(dispatcher: Dispatcher, strategy: Arc<dyn IntentStrategy>, vocabulary: Arc<Vocabulary>) -> Self {
        Self {
            dispatcher,
            gateway: LlmGateway::disabled(),
            strategy,
            extractor: Arc::new(ParamExtractor::new(vocabulary.clone())),
            vocabulary,
            plans: Arc::new(PlanLibrary::new()),
            confirmation: Arc::new(AlwaysConfirm),
            pending: PendingConfirmations::default(),
            config: LoopConfig::default(),
        }
    }

    pub fn with_gateway(mut self, gateway: LlmGateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_plans(mut self, plans: PlanLibrary) -> Self {
        self.plans = Arc::new(plans);
        self
    }

    pub fn with_confirmation(mut self, policy: Box<dyn ConfirmationPolicy>) -> Self {
        self.confirmation = Arc::from(policy);
        self
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn plans(&self) -> &PlanLibrary {
        &self.plans
    }

    pub fn pending(&self) -> &PendingConfirmations {
        &self.pending
    }

    #[instrument(skip(self, text, session), fields(session_id = %session.session_id, user_id = %session.user.user_id, role = %session.user.role))]
    pub async fn process_turn(&self, text: &str, session: &SessionContext) -> OntosResult<TurnResponse> {
        let mut ctx = TurnContext::new(session);
        let mut trace = TurnTrace::default();
        let mut response = self.run(&mut ctx, &mut trace, text).await?;
        trace.llm_calls = std::mem::take(&mut ctx.llm_calls);
        trace.elapsed_ms = ctx.elapsed_ms();
        info!(
            turn_id = %ctx.turn_id,
            kind = ?response.kind,
            llm_calls = trace.llm_calls.len(),
            elapsed_ms = trace.elapsed_ms,
            "turn processed"
        );
        response.trace = trace;
        Ok(response)
    }

    async fn run(&self, ctx: &mut TurnContext, trace: &mut TurnTrace, text: &str) -> OntosResult<TurnResponse> {
        if let Some(response) = self.answer_pending(ctx, text).await? {
            return Ok(response);
        }

        let observation = observe(&self.gateway, ctx, text).await;
        trace.observation = Some(observation.clone());
        match observation.kind {
            UtteranceKind::Help => Ok(self.help(ctx)),
            UtteranceKind::Query => self.query(ctx, text),
            UtteranceKind::Action => self.act(ctx, trace, text).await,
        }
    }

    /// A yes/no to the session's pending confirmation. Any other utterance
    /// drops the pending request and is processed as a new one.
    async fn answer_pending(&self, ctx: &TurnContext, text: &str) -> OntosResult<Option<TurnResponse>> {
        if self.pending.pending_for_session(&ctx.session_id).await.is_none() {
            return Ok(None);
        }
        let reply = detect_reply(text);
        let approved = reply == Some(Reply::Affirm);
        let Some((pending, _)) = self
            .pending
            .resolve(&ctx.session_id, approved, &ctx.user.user_id)
            .await
        else {
            return Ok(None);
        };
        match reply {
            Some(Reply::Affirm) => self.run_confirmed(ctx, pending).await.map(Some),
            Some(Reply::Deny) => Ok(Some(TurnResponse::new(
                ctx,
                TurnKind::Cancelled,
                format!("已取消 {}", pending.action.trim_start_matches(PLAN_PREFIX)),
            ))),
            None => {
                debug!(action = %pending.action, "pending confirmation superseded");
                Ok(None)
            }
        }
    }

    async fn run_confirmed(&self, ctx: &TurnContext, pending: PendingConfirmation) -> OntosResult<TurnResponse> {
        let action_ctx = ctx.action_context();
        if let Some(name) = pending.action.strip_prefix(PLAN_PREFIX) {
            let template = self
                .plans
                .get(name)
                .ok_or_else(|| OntosError::Configuration(format!("plan template vanished: {name}")))?;
            let vars = pending.params.as_object().cloned().unwrap_or_default();
            let plan = self.plans.expand(template, vars)?;
            let outcome = execute_plan(&self.dispatcher, plan, &action_ctx).await?;
            return Ok(TurnResponse::from_plan(ctx, outcome));
        }
        let result = self
            .dispatcher
            .dispatch(&pending.action, pending.params, &action_ctx)
            .await?;
        Ok(TurnResponse::from_result(ctx, result))
    }

    fn help(&self, ctx: &TurnContext) -> TurnResponse {
        let mut message = String::from("我可以帮你:");
        for action in self.dispatcher.actions().visible_to(&ctx.user.role) {
            message.push_str(&format!("\n- {}: {}", action.name, action.description));
        }
        TurnResponse::new(ctx, TurnKind::Help, message)
    }

    fn query(&self, ctx: &TurnContext, text: &str) -> OntosResult<TurnResponse> {
        let registry = &self.dispatcher.services().registry;
        let Some(entity) = detect_entity(registry, text) else {
            return Ok(TurnResponse::new(ctx, TurnKind::Query, "没有识别出要查询的对象"));
        };
        match run_query(
            &self.dispatcher,
            &self.vocabulary,
            &ctx.user,
            entity,
            text,
            self.config.query_limit,
        ) {
            Ok(result) => {
                let mut response = TurnResponse::new(
                    ctx,
                    TurnKind::Query,
                    format!("找到 {} 条{}记录", result.total, entity.name),
                );
                response.query = Some(result);
                Ok(response)
            }
            Err(err) if err.is_domain() => {
                let mut response = TurnResponse::new(ctx, TurnKind::Query, err.to_string());
                response.results.push(ActionResult::failure(&err));
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    async fn act(&self, ctx: &mut TurnContext, trace: &mut TurnTrace, text: &str) -> OntosResult<TurnResponse> {
        if let Some(template) = self.plans.match_text(text) {
            return self.act_on_plan(ctx, template, text).await;
        }

        let intent = match self.strategy.extract(ctx, text).await {
            Ok(intent) => intent,
            Err(OntosError::UpstreamUnavailable { reason, .. }) => {
                debug!(%reason, strategy = self.strategy.name(), "no intent available");
                Intent::unrecognised(IntentSource::Llm)
            }
            Err(err) => return Err(err),
        };
        trace.intent = Some(intent.clone());

        let meta = intent
            .action_type
            .as_deref()
            .filter(|_| intent.is_usable(self.config.min_intent_confidence))
            .and_then(|name| self.dispatcher.actions().metadata(name));
        let Some(meta) = meta else {
            return Ok(self.unrecognised(ctx, &intent));
        };
        if !intent.missing_fields.is_empty() {
            return Ok(TurnResponse::clarify(
                ctx,
                Clarification::missing(&meta.name, intent.missing_fields.clone()),
            ));
        }
        let params = match resolve_references(&self.dispatcher, meta, intent.params.clone(), &ctx.user)? {
            Resolution::Resolved(params) => params,
            Resolution::Ambiguous(clarification) => return Ok(TurnResponse::clarify(ctx, clarification)),
        };
        self.invoke(ctx, meta, params).await
    }

    async fn invoke(&self, ctx: &TurnContext, meta: &ActionMetadata, params: Params) -> OntosResult<TurnResponse> {
        let action_ctx = ctx.action_context();
        let raw = Value::Object(params);
        if let Some(reason) = self.confirmation.requires_confirmation(meta, &raw) {
            let prepared = match self.dispatcher.prepare(&meta.name, &raw, &action_ctx) {
                Ok(prepared) => prepared,
                Err(err) if err.is_domain() => {
                    return Ok(TurnResponse::from_result(ctx, ActionResult::failure(&err)));
                }
                Err(err) => return Err(err),
            };
            let pending = self
                .pending
                .enqueue(ctx.session_id.clone(), &meta.name, Value::Object(prepared.params), &reason)
                .await;
            let mut response = TurnResponse::new(
                ctx,
                TurnKind::Confirmation,
                format!("{reason}：即将执行「{}」，确认吗？(是/否)", meta.description),
            );
            response.confirmation = Some(pending);
            return Ok(response);
        }
        let result = self.dispatcher.dispatch(&meta.name, raw, &action_ctx).await?;
        Ok(TurnResponse::from_result(ctx, result))
    }

    fn plan_vars(&self, template: &PlanTemplate, text: &str) -> Params {
        let mut vars = Params::new();
        for step in &template.steps {
            if let Some(meta) = self.dispatcher.actions().metadata(&step.action) {
                for (name, value) in self.extractor.extract(meta, text) {
                    vars.entry(name).or_insert(value);
                }
            }
        }
        vars
    }

    fn plan_confirmation(&self, plan: &ExecutionPlan) -> Option<String> {
        let vars = Value::Object(plan.vars.clone());
        plan.steps.iter().find_map(|step| {
            self.dispatcher
                .actions()
                .metadata(&step.action)
                .and_then(|meta| self.confirmation.requires_confirmation(meta, &vars))
        })
    }

    async fn act_on_plan(&self, ctx: &TurnContext, template: &PlanTemplate, text: &str) -> OntosResult<TurnResponse> {
        let plan = self.plans.expand(template, self.plan_vars(template, text))?;
        debug!(plan = %plan.template, steps = plan.steps.len(), "compound goal expanded");
        if let Some(reason) = self.plan_confirmation(&plan) {
            let pending = self
                .pending
                .enqueue(
                    ctx.session_id.clone(),
                    format!("{PLAN_PREFIX}{}", template.name),
                    Value::Object(plan.vars.clone()),
                    &reason,
                )
                .await;
            let mut response = TurnResponse::new(
                ctx,
                TurnKind::Confirmation,
                format!("{reason}：即将执行「{}」({} 步)，确认吗？(是/否)", plan.description, plan.steps.len()),
            );
            response.confirmation = Some(pending);
            return Ok(response);
        }
        let outcome = execute_plan(&self.dispatcher, plan, &ctx.action_context()).await?;
        Ok(TurnResponse::from_plan(ctx, outcome))
    }

    fn unrecognised(&self, ctx: &TurnContext, intent: &Intent) -> TurnResponse {
        let suggestions: Vec<&str> = intent
            .candidates
            .iter()
            .filter_map(|hit| self.dispatcher.actions().metadata(&hit.action))
            .map(|meta| meta.description.as_str())
            .take(3)
            .collect();
        let message = if suggestions.is_empty() {
            "没能理解你的请求，可以说「帮助」查看我能做什么".to_owned()
        } else {
            format!("没能确定你的意思，你是想: {} ?", suggestions.join(" / "))
        };
        TurnResponse::new(ctx, TurnKind::Unrecognized, message)
    }
}
