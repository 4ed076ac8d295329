//! Act: run one action or walk a plan.

use std::collections::HashMap;

use ontos_actions::Dispatcher;
use ontos_protocol::{ActionContext, ActionResult, OntosResult, SnapshotId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::decide::{Clarification, ExecutionPlan, Resolution, bind_params, resolve_references};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub action: String,
    pub result: ActionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub plan: ExecutionPlan,
    pub steps: Vec<StepResult>,
    /// Steps never attempted because an earlier step failed.
    pub skipped: Vec<String>,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<Clarification>,
}

impl PlanOutcome {
    pub fn results(&self) -> Vec<ActionResult> {
        self.steps.iter().map(|s| s.result.clone()).collect()
    }

    pub fn summary(&self) -> String {
        let done: Vec<&str> = self
            .steps
            .iter()
            .filter(|s| s.result.success)
            .map(|s| s.result.message.as_str())
            .collect();
        if self.completed {
            return format!("{}完成: {}", self.plan.description, done.join("；"));
        }
        let failed = self.steps.iter().find(|s| !s.result.success);
        match (failed, &self.clarification) {
            (_, Some(clarification)) => clarification.question.clone(),
            (Some(step), None) => format!(
                "{} 在步骤 {} 失败: {}；已跳过 {} 个后续步骤",
                self.plan.description,
                step.step_id,
                step.result.message,
                self.skipped.len()
            ),
            (None, None) => self.plan.description.clone(),
        }
    }
}

/// Executes plan steps in order. Each step binds its parameters from the
/// plan variables and upstream outputs, resolves references, then goes
/// through the full dispatch pipeline. The first failure or ambiguity stops
/// the plan. Snapshots of the steps that ran are linked so a cascading undo
/// reverses the whole plan.
#[instrument(skip(dispatcher, plan, ctx), fields(plan = %plan.template, plan_id = %plan.plan_id))]
pub async fn execute_plan(
    dispatcher: &Dispatcher,
    plan: ExecutionPlan,
    ctx: &ActionContext,
) -> OntosResult<PlanOutcome> {
    let mut outputs: HashMap<String, ActionResult> = HashMap::new();
    let mut steps = Vec::new();
    let mut clarification = None;
    let mut stopped_at = None;

    for (index, step) in plan.steps.iter().enumerate() {
        let params = bind_params(step, &plan.vars, &outputs);
        let params = match dispatcher.actions().metadata(&step.action) {
            Some(meta) => match resolve_references(dispatcher, meta, params, &ctx.user)? {
                Resolution::Resolved(params) => params,
                Resolution::Ambiguous(question) => {
                    clarification = Some(question);
                    stopped_at = Some(index);
                    break;
                }
            },
            None => params,
        };
        let result = dispatcher.dispatch(&step.action, Value::Object(params), ctx).await?;
        let success = result.success;
        outputs.insert(step.id.clone(), result.clone());
        steps.push(StepResult {
            step_id: step.id.clone(),
            action: step.action.clone(),
            result,
        });
        if !success {
            warn!(step = %step.id, action = %step.action, "plan step failed, skipping the rest");
            stopped_at = Some(index + 1);
            break;
        }
    }

    let skipped: Vec<String> = stopped_at
        .map(|from| plan.steps[from..].iter().map(|s| s.id.clone()).collect())
        .unwrap_or_default();
    let snapshots: Vec<SnapshotId> = steps.iter().filter_map(|s| s.result.snapshot_id.clone()).collect();
    if snapshots.len() > 1 {
        dispatcher.services().snapshots.link_related(&snapshots)?;
    }
    let completed = skipped.is_empty() && clarification.is_none();
    info!(completed, steps = steps.len(), skipped = skipped.len(), "plan finished");
    Ok(PlanOutcome {
        plan,
        steps,
        skipped,
        completed,
        clarification,
    })
}
