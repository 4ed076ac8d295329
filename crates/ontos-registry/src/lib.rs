//! Ontology registry.
//!
//! Holds entity, relationship, interface, state machine and action metadata.
//! It is populated once at startup through `&mut self` registration calls and
//! then shared read-only behind an `Arc`. Lookups for unknown names return
//! `None` or an empty collection; they never fail.

use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;

use indexmap::IndexMap;
use ontos_protocol::{
    ActionMetadata, Cardinality, EntityMetadata, InterfaceDefinition, InterfaceExport,
    OntosResult, RelationshipMetadata, SchemaExport, StateMachineDef,
};
use tracing::{debug, warn};

pub const DEFAULT_MAX_HOPS: usize = 4;

#[derive(Debug, Clone)]
pub struct OntologyRegistry {
    entities: IndexMap<String, EntityMetadata>,
    relationships: IndexMap<String, Vec<RelationshipMetadata>>,
    state_machines: IndexMap<String, StateMachineDef>,
    interfaces: IndexMap<String, InterfaceDefinition>,
    implementations: IndexMap<String, Vec<String>>,
    actions: IndexMap<String, ActionMetadata>,
    max_hops: usize,
}

impl Default for OntologyRegistry {
    fn default() -> Self {
        Self {
            entities: IndexMap::new(),
            relationships: IndexMap::new(),
            state_machines: IndexMap::new(),
            interfaces: IndexMap::new(),
            implementations: IndexMap::new(),
            actions: IndexMap::new(),
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

impl OntologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn max_hops(&self) -> usize {
        self.max_hops
    }

    /// Last write wins.
    pub fn register_entity(&mut self, meta: EntityMetadata) -> OntosResult<()> {
        meta.validate()?;
        debug!(entity = %meta.name, "registered entity");
        self.entities.insert(meta.name.clone(), meta);
        Ok(())
    }

    /// Replaces any relationship of the same name declared on `source`.
    pub fn register_relationship(&mut self, source: &str, mut meta: RelationshipMetadata) {
        meta.source = source.to_owned();
        let outgoing = self.relationships.entry(source.to_owned()).or_default();
        outgoing.retain(|r| r.name != meta.name);
        outgoing.push(meta);
    }

    pub fn register_state_machine(&mut self, machine: StateMachineDef) -> OntosResult<()> {
        machine.validate()?;
        self.state_machines.insert(machine.entity.clone(), machine);
        Ok(())
    }

    pub fn register_interface(&mut self, interface: InterfaceDefinition) {
        self.interfaces.insert(interface.name.clone(), interface);
    }

    /// Records that `implementor` (an entity name) implements `interface`.
    /// Missing required properties are reported but do not block registration.
    pub fn register_interface_implementation(&mut self, interface: &str, implementor: &str) {
        if let (Some(def), Some(entity)) = (self.interfaces.get(interface), self.entities.get(implementor)) {
            for property in &def.required_properties {
                if entity.get_property(property).is_none() {
                    warn!(interface, implementor, property = %property, "implementation lacks required property");
                }
            }
        }
        let implementors = self.implementations.entry(interface.to_owned()).or_default();
        if !implementors.iter().any(|i| i == implementor) {
            implementors.push(implementor.to_owned());
        }
    }

    pub fn register_action(&mut self, meta: ActionMetadata) {
        if !self.entities.contains_key(&meta.entity) {
            warn!(action = %meta.name, entity = %meta.entity, "action targets an unregistered entity");
        }
        self.actions.insert(meta.name.clone(), meta);
    }

    pub fn get_entity(&self, name: &str) -> Option<&EntityMetadata> {
        self.entities.get(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.values()
    }

    pub fn get_relationships(&self, source: &str) -> &[RelationshipMetadata] {
        self.relationships.get(source).map_or(&[], Vec::as_slice)
    }

    pub fn get_state_machine(&self, entity: &str) -> Option<&StateMachineDef> {
        self.state_machines.get(entity)
    }

    pub fn state_machines(&self) -> impl Iterator<Item = &StateMachineDef> {
        self.state_machines.values()
    }

    pub fn get_interface(&self, name: &str) -> Option<&InterfaceDefinition> {
        self.interfaces.get(name)
    }

    pub fn get_implementations(&self, interface: &str) -> &[String] {
        self.implementations.get(interface).map_or(&[], Vec::as_slice)
    }

    pub fn get_action(&self, name: &str) -> Option<&ActionMetadata> {
        self.actions.get(name)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionMetadata> {
        self.actions.values()
    }

    pub fn actions_for_entity<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a ActionMetadata> {
        self.actions.values().filter(move |a| a.entity == entity)
    }

    pub fn export_schema(&self) -> SchemaExport {
        SchemaExport {
            entities: self.entities.values().cloned().collect(),
            actions: self.actions.values().cloned().collect(),
            interfaces: self
                .interfaces
                .values()
                .map(|definition| InterfaceExport {
                    definition: definition.clone(),
                    implementations: self.get_implementations(&definition.name).to_vec(),
                })
                .collect(),
            relationships: self.relationships.values().flatten().cloned().collect(),
            state_machines: self.state_machines.values().cloned().collect(),
        }
    }

    /// Re-registers everything in `export`. Registering the same export twice
    /// leaves the registry unchanged.
    pub fn import_schema(&mut self, export: SchemaExport) -> OntosResult<()> {
        for entity in export.entities {
            self.register_entity(entity)?;
        }
        for relationship in export.relationships {
            let source = relationship.source.clone();
            self.register_relationship(&source, relationship);
        }
        for machine in export.state_machines {
            self.register_state_machine(machine)?;
        }
        for interface in export.interfaces {
            let name = interface.definition.name.clone();
            self.register_interface(interface.definition);
            for implementor in interface.implementations {
                self.register_interface_implementation(&name, &implementor);
            }
        }
        for action in export.actions {
            self.register_action(action);
        }
        Ok(())
    }

    /// Shortest relationship path from `from` to `to`, walking declared
    /// relationships forwards and, where an inverse name exists, backwards.
    /// Paths longer than the configured hop bound are not found.
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<RelationshipMetadata>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut visited: HashSet<&str> = HashSet::from([from]);
        let mut queue: VecDeque<(String, Vec<RelationshipMetadata>)> =
            VecDeque::from([(from.to_owned(), Vec::new())]);

        while let Some((node, path)) = queue.pop_front() {
            if path.len() >= self.max_hops {
                continue;
            }
            for edge in self.edges_from(&node) {
                if visited.contains(edge.target.as_str()) {
                    continue;
                }
                let mut next = path.clone();
                let target = edge.target.clone();
                next.push(edge);
                if target == to {
                    return Some(next);
                }
                if let Some((key, _)) = self.entities.get_key_value(target.as_str()) {
                    visited.insert(key.as_str());
                }
                queue.push_back((target, next));
            }
        }
        None
    }

    fn edges_from(&self, entity: &str) -> Vec<RelationshipMetadata> {
        let mut edges = self.get_relationships(entity).to_vec();
        for relationship in self.relationships.values().flatten() {
            if relationship.target != entity {
                continue;
            }
            if let Some(inverse) = &relationship.inverse_name {
                edges.push(RelationshipMetadata {
                    name: inverse.clone(),
                    source: relationship.target.clone(),
                    target: relationship.source.clone(),
                    cardinality: invert(relationship.cardinality),
                    foreign_key: relationship.foreign_key.clone(),
                    inverse_name: Some(relationship.name.clone()),
                });
            }
        }
        edges
    }

    /// Compact textual schema used when building LLM prompts.
    pub fn describe_for_prompt(&self) -> String {
        let mut out = String::from("Entities:\n");
        for entity in self.entities.values() {
            let properties: Vec<&str> = entity.properties.iter().map(|p| p.name.as_str()).collect();
            let _ = writeln!(out, "- {}: {} [{}]", entity.name, entity.description, properties.join(", "));
        }
        out.push_str("Actions:\n");
        for action in self.actions.values() {
            let params: Vec<String> = action
                .params
                .iter()
                .map(|p| if p.required { format!("{}*", p.name) } else { p.name.clone() })
                .collect();
            let _ = writeln!(out, "- {}({}) on {}: {}", action.name, params.join(", "), action.entity, action.description);
        }
        out
    }

    /// Test-only reset.
    pub fn clear(&mut self) {
        let max_hops = self.max_hops;
        *self = Self::default().with_max_hops(max_hops);
    }
}

fn invert(cardinality: Cardinality) -> Cardinality {
    match cardinality {
        Cardinality::OneToMany => Cardinality::ManyToOne,
        Cardinality::ManyToOne => Cardinality::OneToMany,
        other => other,
    }
}
