//! Ontology metadata: entities, properties, relationships, interfaces,
//! actions, state machines and constraints.
//!
//! These are plain data. Registration, lookup and validation against each
//! other happen in the registry and engine crates.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OntosError, OntosResult};

/// Sensitivity of a property. Totally ordered; used for ACL and masking.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    #[default]
    Public,
    Internal,
    Confidential,
    Restricted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataScopeType {
    #[default]
    Global,
    Scoped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Date,
    DateTime,
    Enum,
    Json,
}

/// What a value means, independent of how it is stored. Drives masking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    #[default]
    Plain,
    Identifier,
    PersonName,
    Phone,
    Email,
    IdNumber,
    Money,
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMetadata {
    pub name: String,
    #[serde(default)]
    pub property_type: PropertyType,
    #[serde(default)]
    pub semantic_type: SemanticType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

impl PropertyMetadata {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            semantic_type: SemanticType::Plain,
            nullable: true,
            unique: false,
            enum_values: Vec::new(),
            security_level: SecurityLevel::Public,
            foreign_key: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn semantic(mut self, semantic_type: SemanticType) -> Self {
        self.semantic_type = semantic_type;
        self
    }

    pub fn security(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.property_type = PropertyType::Enum;
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn references(mut self, entity: impl Into<String>) -> Self {
        self.foreign_key = Some(entity.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Storage identifier (table name) used by the entity store.
    pub table: String,
    #[serde(default)]
    pub is_aggregate_root: bool,
    #[serde(default)]
    pub data_scope_type: DataScopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_column: Option<String>,
    /// Column holding the owning user id, used for self-only visibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_column: Option<String>,
    #[serde(default)]
    pub properties: Vec<PropertyMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lifecycle_states: Vec<String>,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            table: table.into(),
            is_aggregate_root: false,
            data_scope_type: DataScopeType::Global,
            scope_column: None,
            owner_column: None,
            properties: Vec::new(),
            lifecycle_states: Vec::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn aggregate_root(mut self) -> Self {
        self.is_aggregate_root = true;
        self
    }

    pub fn scoped_by(mut self, column: impl Into<String>) -> Self {
        self.data_scope_type = DataScopeType::Scoped;
        self.scope_column = Some(column.into());
        self
    }

    pub fn owned_by(mut self, column: impl Into<String>) -> Self {
        self.owner_column = Some(column.into());
        self
    }

    pub fn property(mut self, property: PropertyMetadata) -> Self {
        self.properties.push(property);
        self
    }

    pub fn lifecycle<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lifecycle_states = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn get_property(&self, name: &str) -> Option<&PropertyMetadata> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// `scope_column` is required iff the entity is scoped.
    pub fn validate(&self) -> OntosResult<()> {
        match (self.data_scope_type, &self.scope_column) {
            (DataScopeType::Scoped, None) => Err(OntosError::Configuration(format!(
                "entity {} is scoped but declares no scope column",
                self.name
            ))),
            (DataScopeType::Global, Some(column)) => Err(OntosError::Configuration(format!(
                "entity {} is global but declares scope column {column}",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipMetadata {
    pub name: String,
    pub source: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub foreign_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_name: Option<String>,
}

impl RelationshipMetadata {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            target: target.into(),
            cardinality,
            foreign_key: foreign_key.into(),
            inverse_name: None,
        }
    }

    pub fn inverse(mut self, name: impl Into<String>) -> Self {
        self.inverse_name = Some(name.into());
        self
    }
}

/// A capability contract several entities may implement (e.g. `Billable`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required_properties: Vec<String>,
    #[serde(default)]
    pub required_actions: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Date,
    Object,
    Array,
}

/// One parameter of an action's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    /// Entity this parameter refers to by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_ref: Option<String>,
    /// Human-facing fields that identify the referenced row (e.g. room number).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lookup_fields: Vec<String>,
    /// Regexes whose first capture group yields the value from free text.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extract_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: String::new(),
            enum_values: Vec::new(),
            entity_ref: None,
            lookup_fields: Vec::new(),
            extract_patterns: Vec::new(),
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn refers_to<I, S>(mut self, entity: impl Into<String>, lookup_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ref = Some(entity.into());
        self.lookup_fields = lookup_fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn extract<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extract_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Declarative description of an executable action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMetadata {
    pub name: String,
    pub entity: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Empty means unrestricted.
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    #[serde(default)]
    pub undoable: bool,
    #[serde(default)]
    pub side_effects: Vec<String>,
    #[serde(default)]
    pub search_keywords: Vec<String>,
    #[serde(default)]
    pub risk: RiskLevel,
}

impl ActionMetadata {
    pub fn new(name: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity: entity.into(),
            description: String::new(),
            category: "mutation".to_owned(),
            params: Vec::new(),
            requires_confirmation: false,
            allowed_roles: BTreeSet::new(),
            undoable: false,
            side_effects: Vec::new(),
            search_keywords: Vec::new(),
            risk: RiskLevel::Low,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn confirm(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn undoable(mut self) -> Self {
        self.undoable = true;
        self
    }

    pub fn side_effects<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.side_effects = effects.into_iter().map(Into::into).collect();
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn allows_role(&self, role: &str) -> bool {
        self.allowed_roles.is_empty() || self.allowed_roles.contains(role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub to: String,
    pub trigger: String,
    /// Expression over the transition context that must hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub side_effects: Vec<String>,
}

impl TransitionDef {
    pub fn new(from: impl Into<String>, to: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            trigger: trigger.into(),
            condition: None,
            side_effects: Vec::new(),
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn emits<I, S>(mut self, effects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.side_effects = effects.into_iter().map(Into::into).collect();
        self
    }
}

/// Lifecycle of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachineDef {
    pub entity: String,
    #[serde(default = "default_state_field")]
    pub state_field: String,
    pub states: Vec<String>,
    pub initial: String,
    #[serde(default)]
    pub finals: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
}

fn default_state_field() -> String {
    "status".to_owned()
}

impl StateMachineDef {
    pub fn new<I, S>(entity: impl Into<String>, states: I, initial: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity: entity.into(),
            state_field: default_state_field(),
            states: states.into_iter().map(Into::into).collect(),
            initial: initial.into(),
            finals: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn finals<I, S>(mut self, finals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.finals = finals.into_iter().map(Into::into).collect();
        self
    }

    pub fn transition(mut self, transition: TransitionDef) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.finals.iter().any(|s| s == state)
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn transitions_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a TransitionDef> {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    pub fn validate(&self) -> OntosResult<()> {
        let fail = |message: String| {
            Err(OntosError::Configuration(format!(
                "state machine {}: {message}",
                self.entity
            )))
        };

        if !self.has_state(&self.initial) {
            return fail(format!("initial state {} is not declared", self.initial));
        }
        for state in &self.finals {
            if !self.has_state(state) {
                return fail(format!("final state {state} is not declared"));
            }
        }
        for (index, t) in self.transitions.iter().enumerate() {
            if !self.has_state(&t.from) || !self.has_state(&t.to) {
                return fail(format!(
                    "transition {} -> {} references an undeclared state",
                    t.from, t.to
                ));
            }
            if self.is_final(&t.from) {
                return fail(format!("final state {} has an outgoing transition", t.from));
            }
            let ambiguous = self.transitions[..index]
                .iter()
                .any(|other| other.from == t.from && other.trigger == t.trigger && other.to != t.to);
            if ambiguous {
                return fail(format!(
                    "trigger {} from {} leads to more than one state",
                    t.trigger, t.from
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

/// A severity-tagged business rule bound to an entity/action pair.
///
/// A constraint may carry a named-function condition, an expression
/// condition, or both; when both are present both must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintMetadata {
    pub id: String,
    pub entity: String,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_fn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expr: Option<String>,
    #[serde(default)]
    pub severity: Severity,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub valid_alternatives: Vec<String>,
}

impl ConstraintMetadata {
    pub fn new(
        id: impl Into<String>,
        entity: impl Into<String>,
        action: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            action: action.into(),
            description: String::new(),
            condition_fn: None,
            condition_expr: None,
            severity: Severity::Error,
            error_message: error_message.into(),
            suggestion_message: None,
            valid_alternatives: Vec::new(),
        }
    }

    pub fn expr(mut self, expression: impl Into<String>) -> Self {
        self.condition_expr = Some(expression.into());
        self
    }

    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.condition_fn = Some(name.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion_message = Some(suggestion.into());
        self
    }

    pub fn alternatives<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.valid_alternatives = values.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceExport {
    pub definition: InterfaceDefinition,
    pub implementations: Vec<String>,
}

/// Introspectable snapshot of everything registered in the ontology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaExport {
    pub entities: Vec<EntityMetadata>,
    pub actions: Vec<ActionMetadata>,
    pub interfaces: Vec<InterfaceExport>,
    pub relationships: Vec<RelationshipMetadata>,
    pub state_machines: Vec<StateMachineDef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_machine() -> StateMachineDef {
        StateMachineDef::new("Task", ["pending", "assigned", "completed"], "pending")
            .finals(["completed"])
            .transition(TransitionDef::new("pending", "assigned", "assign"))
            .transition(TransitionDef::new("assigned", "completed", "complete"))
    }

    #[test]
    fn security_levels_are_totally_ordered() {
        assert!(SecurityLevel::Public < SecurityLevel::Internal);
        assert!(SecurityLevel::Internal < SecurityLevel::Confidential);
        assert!(SecurityLevel::Confidential < SecurityLevel::Restricted);
    }

    #[test]
    fn scoped_entity_requires_scope_column() {
        let mut entity = EntityMetadata::new("Room", "rooms").scoped_by("branch_id");
        assert!(entity.validate().is_ok());
        entity.scope_column = None;
        assert!(entity.validate().is_err());
    }

    #[test]
    fn state_machine_rejects_ambiguous_trigger() {
        let machine = task_machine().transition(TransitionDef::new("pending", "completed", "assign"));
        let err = machine.validate().unwrap_err();
        assert!(err.to_string().contains("more than one state"));
    }

    #[test]
    fn state_machine_rejects_transition_out_of_final_state() {
        let machine = task_machine().transition(TransitionDef::new("completed", "pending", "reopen"));
        assert!(machine.validate().is_err());
    }

    #[test]
    fn state_machine_rejects_undeclared_initial_state() {
        let mut machine = task_machine();
        machine.initial = "draft".into();
        assert!(machine.validate().is_err());
        assert!(task_machine().validate().is_ok());
    }

    #[test]
    fn empty_role_set_means_unrestricted() {
        let open = ActionMetadata::new("start_task", "Task");
        assert!(open.allows_role("cleaner"));
        let closed = ActionMetadata::new("adjust_bill", "Bill").roles(["manager"]);
        assert!(!closed.allows_role("receptionist"));
        assert!(closed.allows_role("manager"));
    }
}
