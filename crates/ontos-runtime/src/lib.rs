//! Conversational turn loop over the action core.
//!
//! A turn is classified ([`observe`]), mapped to an intent by a pluggable
//! [`IntentStrategy`] ([`orient`]), grounded against stored rows or expanded
//! into a plan ([`decide`]), and executed through the dispatcher ([`act`]).
//! The LLM is optional at every step: calls go through [`LlmGateway`] with a
//! timeout and every failure falls back to keyword rules.

pub mod act;
pub mod context;
pub mod decide;
pub mod engine;
pub mod gateway;
pub mod observe;
pub mod orient;
pub mod query;

pub use act::{PlanOutcome, StepResult, execute_plan};
pub use context::{LlmCallOutcome, LlmCallRecord, SessionContext, TurnContext};
pub use decide::{
    Candidate, Clarification, ExecutionPlan, PlanLibrary, PlanStep, PlanTemplate, Resolution, bind_params,
    resolve_references,
};
pub use engine::{LoopConfig, OodaLoop, TurnKind, TurnResponse, TurnTrace};
pub use gateway::LlmGateway;
pub use observe::{Observation, ObservationSource, Reply, UtteranceKind, classify_by_keywords, detect_reply};
pub use orient::{
    FallbackIntentStrategy, Intent, IntentSource, IntentStrategy, LlmIntentStrategy, ParamExtractor,
    RuleIntentStrategy,
};
pub use query::{QueryResult, detect_entity, run_query};
