use chrono::{DateTime, Utc};
use ontos_protocol::{
    ActionContext, ActionMetadata, ActionResult, OntosError, OntosResult, StoreTransaction,
    UserContext,
};
use ontos_registry::OntologyRegistry;
use ontos_rules::{StateMachineEngine, TransitionOutcome};
use serde_json::Value;

use crate::validate::Params;

/// Everything a handler may consult while it runs. Parameters have already
/// been validated against the action's schema.
pub struct ActionEnv<'a> {
    pub action: &'a ActionMetadata,
    pub params: &'a Params,
    pub context: &'a ActionContext,
    pub registry: &'a OntologyRegistry,
    pub state_machines: &'a StateMachineEngine,
    /// Whatever `load_context` returned; `Null` while it runs.
    pub before: &'a Value,
}

impl ActionEnv<'_> {
    pub fn user(&self) -> &UserContext {
        &self.context.user
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.context.now
    }

    fn missing(&self, name: &str) -> OntosError {
        OntosError::validation(
            self.action.name.clone(),
            vec![ontos_protocol::FieldError::new(name, "is required")],
        )
    }

    pub fn str_param(&self, name: &str) -> OntosResult<&str> {
        self.opt_str(name).ok_or_else(|| self.missing(name))
    }

    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(Value::as_str)
    }

    pub fn f64_param(&self, name: &str) -> OntosResult<f64> {
        self.opt_f64(name).ok_or_else(|| self.missing(name))
    }

    pub fn opt_f64(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(Value::as_f64)
    }

    pub fn opt_i64(&self, name: &str) -> Option<i64> {
        self.params.get(name).and_then(Value::as_i64)
    }

    /// Runs a lifecycle transition on a stored row inside `tx`.
    pub fn transition(
        &self,
        tx: &mut dyn StoreTransaction,
        entity: &str,
        id: &str,
        trigger: &str,
    ) -> OntosResult<TransitionOutcome> {
        self.state_machines
            .apply(tx, entity, id, trigger, &Value::Object(self.params.clone()))
    }
}

/// Executable body of a registered action.
///
/// Handlers run inside the dispatcher's transaction; returning an error (or
/// a failed result) discards every write they made.
pub trait ActionHandler: Send + Sync {
    /// Pre-mutation state exposed to constraints as `before`.
    fn load_context(&self, _env: &ActionEnv<'_>, _tx: &dyn StoreTransaction) -> OntosResult<Value> {
        Ok(Value::Null)
    }

    fn execute(&self, env: &ActionEnv<'_>, tx: &mut dyn StoreTransaction) -> OntosResult<ActionResult>;
}

type ExecuteFn =
    dyn Fn(&ActionEnv<'_>, &mut dyn StoreTransaction) -> OntosResult<ActionResult> + Send + Sync;
type LoadFn = dyn Fn(&ActionEnv<'_>, &dyn StoreTransaction) -> OntosResult<Value> + Send + Sync;

/// Closure-backed handler.
pub struct FnAction {
    load: Option<Box<LoadFn>>,
    execute: Box<ExecuteFn>,
}

impl FnAction {
    pub fn new<F>(execute: F) -> Self
    where
        F: Fn(&ActionEnv<'_>, &mut dyn StoreTransaction) -> OntosResult<ActionResult> + Send + Sync + 'static,
    {
        Self {
            load: None,
            execute: Box::new(execute),
        }
    }

    pub fn with_context<L>(mut self, load: L) -> Self
    where
        L: Fn(&ActionEnv<'_>, &dyn StoreTransaction) -> OntosResult<Value> + Send + Sync + 'static,
    {
        self.load = Some(Box::new(load));
        self
    }
}

impl ActionHandler for FnAction {
    fn load_context(&self, env: &ActionEnv<'_>, tx: &dyn StoreTransaction) -> OntosResult<Value> {
        match &self.load {
            Some(load) => load(env, tx),
            None => Ok(Value::Null),
        }
    }

    fn execute(&self, env: &ActionEnv<'_>, tx: &mut dyn StoreTransaction) -> OntosResult<ActionResult> {
        (self.execute)(env, tx)
    }
}
