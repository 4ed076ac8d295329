//! Decide: ground fuzzy parameters in stored rows, and expand compound goals
//! into execution plans.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexMap;
use ontos_actions::{ActionRegistry, Dispatcher, Params};
use ontos_protocol::{
    ActionMetadata, ActionResult, OntosError, OntosResult, PlanId, Row, RowFilter, UserContext, row_id,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub label: String,
}

/// Structured request for more input instead of a guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<String>,
}

impl Clarification {
    pub fn missing(action: &str, fields: Vec<String>) -> Self {
        Self {
            question: format!("执行 {action} 还需要: {}", fields.join(", ")),
            param: None,
            candidates: Vec::new(),
            missing_fields: fields,
        }
    }
}

pub enum Resolution {
    Resolved(Params),
    Ambiguous(Clarification),
}

fn label(row: &Row, fields: &[String], state_field: Option<&str>) -> String {
    let mut parts: Vec<String> = fields
        .iter()
        .map(String::as_str)
        .chain(state_field)
        .filter_map(|f| row.get(f))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    if parts.is_empty() {
        parts.push(row_id(row).unwrap_or_default().to_owned());
    }
    parts.join(" / ")
}

/// Replaces each `entity_ref` parameter given as a human handle (a room
/// number, a name) with the id of the one visible row it denotes. Rows not
/// in a final lifecycle state win over finished ones. Values that match
/// nothing are left for dispatch to report.
pub fn resolve_references(
    dispatcher: &Dispatcher,
    action: &ActionMetadata,
    mut params: Params,
    user: &UserContext,
) -> OntosResult<Resolution> {
    let services = dispatcher.services();
    let machines = dispatcher.state_machines();
    let tx = services.store.begin();

    for spec in &action.params {
        let Some(target) = &spec.entity_ref else { continue };
        let Some(raw) = params.get(&spec.name).cloned() else { continue };
        let handle = match &raw {
            Value::String(s) => s.trim().to_owned(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let entity = services.registry.get_entity(target);
        let visible = |row: &Row| entity.is_none_or(|e| services.security.row_visible(user, e, row));

        if tx.get(target, &handle)?.as_ref().is_some_and(visible) {
            continue;
        }

        let scope = entity
            .map(|e| services.security.scope_filters(user, e))
            .unwrap_or_default();
        let mut found: IndexMap<String, Row> = IndexMap::new();
        for field in &spec.lookup_fields {
            let mut filters = scope.clone();
            filters.push(RowFilter::eq(field.as_str(), Value::String(handle.clone())));
            for row in tx.query(target, &filters)? {
                if visible(&row)
                    && let Some(id) = row_id(&row)
                {
                    found.insert(id.to_owned(), row.clone());
                }
            }
        }

        let state_field = machines.state_field(target);
        if let Some(field) = state_field {
            let live: IndexMap<String, Row> = found
                .iter()
                .filter(|(_, row)| {
                    row.get(field)
                        .and_then(Value::as_str)
                        .is_none_or(|state| !machines.is_final(target, state))
                })
                .map(|(id, row)| (id.clone(), row.clone()))
                .collect();
            if !live.is_empty() {
                found = live;
            }
        }

        match found.len() {
            0 => debug!(param = %spec.name, %handle, "reference matched nothing"),
            1 => {
                if let Some(id) = found.keys().next() {
                    debug!(param = %spec.name, %handle, %id, "reference resolved");
                    params.insert(spec.name.clone(), Value::String(id.clone()));
                }
            }
            _ => {
                let candidates = found
                    .iter()
                    .map(|(id, row)| Candidate {
                        id: id.clone(),
                        label: label(row, &spec.lookup_fields, state_field),
                    })
                    .collect();
                return Ok(Resolution::Ambiguous(Clarification {
                    question: format!("「{handle}」对应多个 {target}，请选择一个"),
                    param: Some(spec.name.clone()),
                    candidates,
                    missing_fields: Vec::new(),
                }));
            }
        }
    }
    Ok(Resolution::Resolved(params))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub action: String,
    /// Literal values, `$var` from the initial parameters, or `$step.field`
    /// from an upstream step's result.
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            params: Params::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with(mut self, param: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(param.into(), value.into());
        self
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// The template matches when every keyword of any one group occurs in
    /// the text.
    pub triggers: Vec<Vec<String>>,
    pub steps: Vec<PlanStep>,
}

impl PlanTemplate {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            triggers: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn trigger<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers
            .push(keywords.into_iter().map(|k| k.into().to_lowercase()).collect());
        self
    }

    pub fn step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn matches(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.triggers
            .iter()
            .any(|group| !group.is_empty() && group.iter().all(|k| lowered.contains(k.as_str())))
    }

    /// Steps in dependency order (Kahn's algorithm, ties in declaration
    /// order). Unknown dependencies and cycles are configuration errors.
    pub fn ordered_steps(&self) -> OntosResult<Vec<PlanStep>> {
        let ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != self.steps.len() {
            return Err(OntosError::Configuration(format!("plan {} repeats a step id", self.name)));
        }
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(OntosError::Configuration(format!(
                        "plan {} step {} depends on unknown step {dep}",
                        self.name, step.id
                    )));
                }
            }
            indegree.insert(&step.id, step.depends_on.len());
        }

        let mut ready: VecDeque<&PlanStep> = self
            .steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .collect();
        let mut ordered = Vec::with_capacity(self.steps.len());
        while let Some(step) = ready.pop_front() {
            ordered.push(step.clone());
            for next in &self.steps {
                if next.depends_on.iter().any(|d| d == &step.id)
                    && let Some(count) = indegree.get_mut(next.id.as_str())
                {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }
        if ordered.len() != self.steps.len() {
            return Err(OntosError::Configuration(format!("plan {} has a dependency cycle", self.name)));
        }
        Ok(ordered)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: PlanId,
    pub template: String,
    pub description: String,
    pub steps: Vec<PlanStep>,
    pub vars: Params,
}

/// Registered plan templates, validated against the action registry.
#[derive(Debug, Clone, Default)]
pub struct PlanLibrary {
    templates: IndexMap<String, PlanTemplate>,
}

impl PlanLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: PlanTemplate, actions: &ActionRegistry) -> OntosResult<()> {
        template.ordered_steps()?;
        if let Some(step) = template.steps.iter().find(|s| !actions.contains(&s.action)) {
            return Err(OntosError::Configuration(format!(
                "plan {} uses unregistered action {}",
                template.name, step.action
            )));
        }
        self.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PlanTemplate> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &PlanTemplate> {
        self.templates.values()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn match_text(&self, text: &str) -> Option<&PlanTemplate> {
        self.templates.values().find(|t| t.matches(text))
    }

    pub fn expand(&self, template: &PlanTemplate, vars: Params) -> OntosResult<ExecutionPlan> {
        Ok(ExecutionPlan {
            plan_id: PlanId::new_uuid(),
            template: template.name.clone(),
            description: template.description.clone(),
            steps: template.ordered_steps()?,
            vars,
        })
    }
}

fn step_output(result: &ActionResult, field: &str) -> Option<Value> {
    match field {
        "entity_id" => result.entity_id.clone().map(Value::String),
        "snapshot_id" => result.snapshot_id.as_ref().map(|s| Value::String(s.to_string())),
        _ => result.data.get(field).cloned(),
    }
}

/// Substitutes `$` references in a step's parameters. Unbound references
/// are dropped so validation reports them as missing.
pub fn bind_params(step: &PlanStep, vars: &Params, outputs: &HashMap<String, ActionResult>) -> Params {
    step.params
        .iter()
        .filter_map(|(name, value)| {
            let Some(reference) = value.as_str().and_then(|s| s.strip_prefix('$')) else {
                return Some((name.clone(), value.clone()));
            };
            let bound = match reference.split_once('.') {
                Some((step_id, field)) => outputs.get(step_id).and_then(|r| step_output(r, field)),
                None => vars.get(reference).cloned(),
            };
            bound.map(|v| (name.clone(), v))
        })
        .collect()
}
