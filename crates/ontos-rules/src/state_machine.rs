//! Lifecycle transitions driven by the state machines in the registry.

use std::sync::Arc;

use ontos_protocol::{OntosError, OntosResult, Row, StateMachineDef, StoreTransaction};
use ontos_registry::OntologyRegistry;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::expr::Expression;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub entity: String,
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub side_effects: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StateMachineEngine {
    registry: Arc<OntologyRegistry>,
}

impl StateMachineEngine {
    pub fn new(registry: Arc<OntologyRegistry>) -> Self {
        Self { registry }
    }

    fn machine(&self, entity: &str) -> OntosResult<&StateMachineDef> {
        self.registry
            .get_state_machine(entity)
            .ok_or_else(|| OntosError::Configuration(format!("no state machine for {entity}")))
    }

    /// True iff some transition (any trigger) leads from `from` to `to`.
    pub fn is_valid_transition(&self, entity: &str, from: &str, to: &str) -> bool {
        self.registry
            .get_state_machine(entity)
            .is_some_and(|m| m.transitions.iter().any(|t| t.from == from && t.to == to))
    }

    pub fn valid_triggers(&self, entity: &str, from: &str) -> Vec<String> {
        self.registry
            .get_state_machine(entity)
            .map(|m| m.transitions_from(from).map(|t| t.trigger.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_final(&self, entity: &str, state: &str) -> bool {
        self.registry
            .get_state_machine(entity)
            .is_some_and(|m| m.is_final(state))
    }

    pub fn state_field(&self, entity: &str) -> Option<&str> {
        self.registry
            .get_state_machine(entity)
            .map(|m| m.state_field.as_str())
    }

    /// Moves `row` along the unique transition for its current state and
    /// `trigger`, writing the new state into the row. `params` is visible to
    /// transition conditions next to `row`.
    pub fn execute_transition(
        &self,
        entity: &str,
        row: &mut Row,
        trigger: &str,
        params: &Value,
    ) -> OntosResult<TransitionOutcome> {
        let machine = self.machine(entity)?;
        let from = row
            .get(&machine.state_field)
            .and_then(Value::as_str)
            .unwrap_or(machine.initial.as_str())
            .to_owned();

        let invalid = || OntosError::InvalidTransition {
            entity: entity.to_owned(),
            from: from.clone(),
            trigger: trigger.to_owned(),
            valid_alternatives: self.valid_triggers(entity, &from),
        };

        if machine.is_final(&from) {
            return Err(invalid());
        }
        let transition = machine
            .transitions_from(&from)
            .find(|t| t.trigger == trigger)
            .ok_or_else(&invalid)?;

        if let Some(condition) = &transition.condition {
            let scope = json!({ "row": row, "params": params });
            let holds = Expression::parse(condition)
                .and_then(|e| e.evaluate_bool(&scope))
                .unwrap_or(false);
            if !holds {
                return Err(invalid());
            }
        }

        row.insert(machine.state_field.clone(), Value::String(transition.to.clone()));
        debug!(entity, from = %from, to = %transition.to, trigger, "state transition");
        Ok(TransitionOutcome {
            entity: entity.to_owned(),
            from: from.clone(),
            to: transition.to.clone(),
            trigger: trigger.to_owned(),
            side_effects: transition.side_effects.clone(),
        })
    }

    /// Loads the row, transitions it and writes it back inside `tx`.
    pub fn apply(
        &self,
        tx: &mut dyn StoreTransaction,
        entity: &str,
        id: &str,
        trigger: &str,
        params: &Value,
    ) -> OntosResult<TransitionOutcome> {
        let mut row = tx.require(entity, id)?;
        let outcome = self.execute_transition(entity, &mut row, trigger, params)?;
        tx.put(entity, row)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ontos_protocol::{EntityStore, TransitionDef};
    use ontos_store::MemoryEntityStore;

    fn engine() -> Result<StateMachineEngine> {
        let mut registry = OntologyRegistry::new();
        registry.register_state_machine(
            StateMachineDef::new("Task", ["pending", "assigned", "in_progress", "completed"], "pending")
                .finals(["completed"])
                .transition(TransitionDef::new("pending", "assigned", "assign").when("params.assignee_id != null"))
                .transition(TransitionDef::new("pending", "in_progress", "start"))
                .transition(TransitionDef::new("assigned", "in_progress", "start"))
                .transition(TransitionDef::new("assigned", "completed", "complete").emits(["TASK_COMPLETED"]))
                .transition(TransitionDef::new("in_progress", "completed", "complete").emits(["TASK_COMPLETED"])),
        )?;
        Ok(StateMachineEngine::new(Arc::new(registry)))
    }

    fn task(status: &str) -> Row {
        json!({"id": "T1", "status": status}).as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn pair_validity_ignores_trigger() -> Result<()> {
        let engine = engine()?;
        assert!(engine.is_valid_transition("Task", "pending", "in_progress"));
        assert!(engine.is_valid_transition("Task", "assigned", "completed"));
        assert!(!engine.is_valid_transition("Task", "completed", "pending"));
        assert!(!engine.is_valid_transition("Task", "pending", "pending"));
        assert!(!engine.is_valid_transition("Ghost", "a", "b"));
        Ok(())
    }

    #[test]
    fn execute_moves_state_and_reports_side_effects() -> Result<()> {
        let engine = engine()?;
        let mut row = task("in_progress");
        let outcome = engine.execute_transition("Task", &mut row, "complete", &Value::Null)?;
        assert_eq!(outcome.to, "completed");
        assert_eq!(outcome.side_effects, vec!["TASK_COMPLETED".to_string()]);
        assert_eq!(row["status"], "completed");
        Ok(())
    }

    #[test]
    fn unknown_trigger_lists_alternatives() -> Result<()> {
        let engine = engine()?;
        let mut row = task("pending");
        let err = engine
            .execute_transition("Task", &mut row, "complete", &Value::Null)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert_eq!(err.valid_alternatives(), ["assign".to_string(), "start".to_string()]);
        assert_eq!(row["status"], "pending");
        Ok(())
    }

    #[test]
    fn final_state_accepts_nothing() -> Result<()> {
        let engine = engine()?;
        let mut row = task("completed");
        assert!(engine.execute_transition("Task", &mut row, "start", &Value::Null).is_err());
        Ok(())
    }

    #[test]
    fn failed_condition_is_invalid_transition() -> Result<()> {
        let engine = engine()?;
        let mut row = task("pending");
        let err = engine
            .execute_transition("Task", &mut row, "assign", &json!({}))
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        engine.execute_transition("Task", &mut row, "assign", &json!({"assignee_id": "E1"}))?;
        assert_eq!(row["status"], "assigned");
        Ok(())
    }

    #[test]
    fn apply_writes_inside_transaction() -> Result<()> {
        let engine = engine()?;
        let store = MemoryEntityStore::new();
        store.seed("Task", [task("pending")])?;
        let mut tx = store.begin();
        engine.apply(tx.as_mut(), "Task", "T1", "start", &Value::Null)?;
        tx.commit()?;
        assert_eq!(store.get("Task", "T1")?.unwrap()["status"], "in_progress");
        Ok(())
    }
}
