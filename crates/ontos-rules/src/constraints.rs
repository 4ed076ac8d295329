//! Constraint engine: severity-tagged business rules bound to `(entity, action)`.
//!
//! A constraint holds when every condition it declares holds. Conditions
//! that cannot be evaluated count as failures.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use ontos_protocol::{ConstraintMetadata, OntosError, OntosResult, Severity, UserContext};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::expr::{ExprError, Expression};

/// Values a constraint can see while an action is being evaluated.
#[derive(Debug, Clone, Serialize)]
pub struct RuleContext {
    pub entity: String,
    pub action: String,
    pub params: Value,
    /// State loaded before the mutation (handler-specific shape).
    pub before: Value,
    /// Proposed state after the mutation, when known.
    pub after: Value,
    pub user: Value,
}

impl RuleContext {
    pub fn new(entity: impl Into<String>, action: impl Into<String>, params: Value) -> Self {
        Self {
            entity: entity.into(),
            action: action.into(),
            params,
            before: Value::Null,
            after: Value::Null,
            user: Value::Null,
        }
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = before;
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = after;
        self
    }

    pub fn with_user(mut self, user: &UserContext) -> Self {
        self.user = json!({
            "id": user.user_id,
            "name": user.display_name,
            "role": user.role,
            "scope_id": user.scope_id,
        });
        self
    }

    /// Root variables visible to expressions.
    pub fn scope(&self) -> Value {
        json!({
            "entity": self.entity,
            "action": self.action,
            "params": self.params,
            "before": self.before,
            "after": self.after,
            "user": self.user,
        })
    }
}

pub type ConditionFn = Arc<dyn Fn(&RuleContext) -> OntosResult<bool> + Send + Sync>;

#[derive(Debug, Clone)]
struct CompiledConstraint {
    meta: ConstraintMetadata,
    expression: Option<Result<Expression, ExprError>>,
}

/// Result of evaluating one constraint.
#[derive(Debug, Clone, Serialize)]
pub struct ConstraintOutcome {
    pub constraint_id: String,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Why evaluation failed, when it failed for a reason other than `false`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConstraintReport {
    pub outcomes: Vec<ConstraintOutcome>,
}

impl ConstraintReport {
    pub fn blocking(&self) -> Option<&ConstraintOutcome> {
        self.outcomes
            .iter()
            .find(|o| !o.passed && o.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ConstraintOutcome> {
        self.outcomes
            .iter()
            .filter(|o| !o.passed && o.severity != Severity::Error)
    }
}

#[derive(Default, Clone)]
pub struct ConstraintEngine {
    constraints: IndexMap<(String, String), Vec<CompiledConstraint>>,
    functions: HashMap<String, ConditionFn>,
}

impl std::fmt::Debug for ConstraintEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintEngine")
            .field("constraints", &self.constraints.values().map(Vec::len).sum::<usize>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConstraintEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Named conditions referenced by `ConstraintMetadata::condition_fn`.
    pub fn register_function<F>(&mut self, name: impl Into<String>, condition: F)
    where
        F: Fn(&RuleContext) -> OntosResult<bool> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(condition));
    }

    /// Registers (or replaces, by id) a constraint. An unparsable expression is
    /// kept and fails every evaluation.
    pub fn register(&mut self, meta: ConstraintMetadata) {
        let expression = meta.condition_expr.as_deref().map(Expression::parse);
        if let Some(Err(err)) = &expression {
            warn!(constraint = %meta.id, error = %err, "constraint expression does not parse; it will always fail");
        }
        let key = (meta.entity.clone(), meta.action.clone());
        let bucket = self.constraints.entry(key).or_default();
        bucket.retain(|c| c.meta.id != meta.id);
        bucket.push(CompiledConstraint { meta, expression });
    }

    /// Constraints bound to the pair, including entity-wide `*` ones.
    pub fn constraints_for(&self, entity: &str, action: &str) -> Vec<&ConstraintMetadata> {
        let exact = self.constraints.get(&(entity.to_owned(), action.to_owned()));
        let wildcard = self.constraints.get(&(entity.to_owned(), "*".to_owned()));
        wildcard
            .into_iter()
            .chain(exact)
            .flatten()
            .map(|c| &c.meta)
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &ConstraintMetadata> {
        self.constraints.values().flatten().map(|c| &c.meta)
    }

    pub fn evaluate(&self, ctx: &RuleContext) -> ConstraintReport {
        let scope = ctx.scope();
        let exact = self.constraints.get(&(ctx.entity.clone(), ctx.action.clone()));
        let wildcard = self.constraints.get(&(ctx.entity.clone(), "*".to_owned()));

        let outcomes = wildcard
            .into_iter()
            .chain(exact)
            .flatten()
            .map(|constraint| {
                let (passed, error) = match self.holds(constraint, ctx, &scope) {
                    Ok(passed) => (passed, None),
                    Err(reason) => (false, Some(reason)),
                };
                ConstraintOutcome {
                    constraint_id: constraint.meta.id.clone(),
                    severity: constraint.meta.severity,
                    passed,
                    message: constraint.meta.error_message.clone(),
                    suggestion: constraint.meta.suggestion_message.clone(),
                    error,
                }
            })
            .collect();
        ConstraintReport { outcomes }
    }

    /// Evaluates all constraints for the context. The first failing
    /// error-severity constraint becomes a `ConstraintViolation`; others are
    /// logged and returned.
    pub fn check(&self, ctx: &RuleContext) -> OntosResult<ConstraintReport> {
        let report = self.evaluate(ctx);
        for outcome in report.warnings() {
            match outcome.severity {
                Severity::Warning => warn!(
                    constraint = %outcome.constraint_id,
                    action = %ctx.action,
                    message = %outcome.message,
                    "constraint warning"
                ),
                _ => info!(
                    constraint = %outcome.constraint_id,
                    action = %ctx.action,
                    message = %outcome.message,
                    "constraint notice"
                ),
            }
        }
        if let Some(blocking) = report.blocking() {
            debug!(
                constraint = %blocking.constraint_id,
                action = %ctx.action,
                error = ?blocking.error,
                "constraint blocked action"
            );
            let alternatives = self
                .all()
                .find(|c| c.id == blocking.constraint_id)
                .map(|c| c.valid_alternatives.clone())
                .unwrap_or_default();
            return Err(OntosError::ConstraintViolation {
                constraint_id: blocking.constraint_id.clone(),
                message: blocking.message.clone(),
                suggestion: blocking.suggestion.clone(),
                valid_alternatives: alternatives,
            });
        }
        Ok(report)
    }

    fn holds(&self, constraint: &CompiledConstraint, ctx: &RuleContext, scope: &Value) -> Result<bool, String> {
        let meta = &constraint.meta;
        if meta.condition_fn.is_none() && constraint.expression.is_none() {
            return Err("constraint declares no condition".into());
        }
        if let Some(name) = &meta.condition_fn {
            let function = self
                .functions
                .get(name)
                .ok_or_else(|| format!("unknown condition function {name}"))?;
            if !function(ctx).map_err(|e| e.to_string())? {
                return Ok(false);
            }
        }
        if let Some(expression) = &constraint.expression {
            let expression = expression.as_ref().map_err(ToString::to_string)?;
            return expression.evaluate_bool(scope).map_err(|e| e.to_string());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> ConstraintEngine {
        let mut engine = ConstraintEngine::new();
        engine.register(
            ConstraintMetadata::new("bill_settled", "StayRecord", "checkout", "账单未结清")
                .expr("before.bill.outstanding <= 0")
                .suggest("请先结清账单再退房"),
        );
        engine.register(
            ConstraintMetadata::new("late_checkout", "StayRecord", "checkout", "超过退房时间")
                .expr("params.hour <= 12")
                .severity(Severity::Warning),
        );
        engine
    }

    fn checkout(outstanding: f64, hour: u32) -> RuleContext {
        RuleContext::new("StayRecord", "checkout", json!({"hour": hour}))
            .with_before(json!({"bill": {"outstanding": outstanding}}))
    }

    #[test]
    fn error_constraint_blocks_with_message_and_suggestion() {
        let err = engine().check(&checkout(120.0, 10)).unwrap_err();
        assert_eq!(err.to_string(), "账单未结清");
        assert_eq!(err.suggestion(), Some("请先结清账单再退房"));
    }

    #[test]
    fn warnings_never_block() {
        let report = engine().check(&checkout(0.0, 15)).expect("warning only");
        assert_eq!(report.warnings().count(), 1);
        assert!(report.blocking().is_none());
    }

    #[test]
    fn evaluation_error_fails_closed() {
        let ctx = RuleContext::new("StayRecord", "checkout", json!({"hour": 9}));
        let report = engine().evaluate(&ctx);
        let bill = &report.outcomes[0];
        assert!(!bill.passed);
        assert!(bill.error.is_some());
    }

    #[test]
    fn unparsable_expression_always_fails() {
        let mut engine = ConstraintEngine::new();
        engine.register(ConstraintMetadata::new("broken", "Room", "*", "bad rule").expr("status =="));
        let ctx = RuleContext::new("Room", "update_room_status", json!({}));
        assert!(engine.check(&ctx).is_err());
    }

    #[test]
    fn function_and_expression_must_both_hold() {
        let mut engine = ConstraintEngine::new();
        engine.register_function("is_manager", |ctx: &RuleContext| Ok(ctx.user["role"] == "manager"));
        engine.register(
            ConstraintMetadata::new("big_adjustment", "Bill", "adjust_bill", "调整金额过大")
                .function("is_manager")
                .expr("abs(params.amount) <= 1000"),
        );
        let manager = UserContext::new("m1", "manager");
        let clerk = UserContext::new("r1", "receptionist");

        let ok = RuleContext::new("Bill", "adjust_bill", json!({"amount": -200})).with_user(&manager);
        assert!(engine.check(&ok).is_ok());

        let too_big = RuleContext::new("Bill", "adjust_bill", json!({"amount": 5000})).with_user(&manager);
        assert!(engine.check(&too_big).is_err());

        let not_manager = RuleContext::new("Bill", "adjust_bill", json!({"amount": 10})).with_user(&clerk);
        assert!(engine.check(&not_manager).is_err());
    }

    #[test]
    fn unknown_function_fails_closed() {
        let mut engine = ConstraintEngine::new();
        engine.register(ConstraintMetadata::new("ghost", "Room", "clean", "missing").function("nope"));
        assert!(engine.check(&RuleContext::new("Room", "clean", json!({}))).is_err());
    }
}
