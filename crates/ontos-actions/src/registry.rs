use std::sync::Arc;

use indexmap::IndexMap;
use ontos_protocol::{ActionMetadata, OntosError, OntosResult};
use tracing::debug;

use crate::discovery::{SearchHit, SemanticIndex};
use crate::handler::ActionHandler;

#[derive(Clone)]
pub struct RegisteredAction {
    pub meta: ActionMetadata,
    pub handler: Arc<dyn ActionHandler>,
}

/// Action name to metadata and handler. Built at startup through
/// [`ActionRegistry::add`], then shared behind an `Arc`.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: IndexMap<String, RegisteredAction>,
    index: SemanticIndex,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action. Names are unique; a second registration under
    /// the same name is a configuration error.
    pub fn add(&mut self, meta: ActionMetadata, handler: impl ActionHandler + 'static) -> OntosResult<()> {
        self.add_shared(meta, Arc::new(handler))
    }

    pub fn add_shared(&mut self, meta: ActionMetadata, handler: Arc<dyn ActionHandler>) -> OntosResult<()> {
        if self.actions.contains_key(&meta.name) {
            return Err(OntosError::Configuration(format!(
                "action registered twice: {}",
                meta.name
            )));
        }
        debug!(action = %meta.name, entity = %meta.entity, "action registered");
        self.index.index(&meta);
        self.actions
            .insert(meta.name.clone(), RegisteredAction { meta, handler });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredAction> {
        self.actions.get(name)
    }

    pub fn metadata(&self, name: &str) -> Option<&ActionMetadata> {
        self.actions.get(name).map(|a| &a.meta)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ActionMetadata> {
        self.actions.values().map(|a| &a.meta)
    }

    pub fn visible_to(&self, role: &str) -> impl Iterator<Item = &ActionMetadata> {
        self.list().filter(move |a| a.allows_role(role))
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Top-`k` actions for free text. With a role, actions that role may not
    /// invoke are skipped.
    pub fn search(&self, text: &str, k: usize, role: Option<&str>) -> Vec<SearchHit> {
        self.index
            .score_all(text)
            .into_iter()
            .filter(|hit| {
                role.is_none_or(|r| self.metadata(&hit.action).is_some_and(|m| m.allows_role(r)))
            })
            .take(k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnAction;
    use ontos_protocol::ActionResult;

    fn noop() -> FnAction {
        FnAction::new(|_, _| Ok(ActionResult::ok("ok")))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ActionRegistry::new();
        assert!(registry.add(ActionMetadata::new("checkout", "StayRecord"), noop()).is_ok());
        let err = registry
            .add(ActionMetadata::new("checkout", "StayRecord"), noop())
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn search_respects_roles() {
        let mut registry = ActionRegistry::new();
        let _ = registry.add(
            ActionMetadata::new("adjust_bill", "Bill")
                .describe("调整账单 adjust bill")
                .roles(["manager"]),
            noop(),
        );
        let _ = registry.add(
            ActionMetadata::new("add_payment", "Bill").describe("账单收款 bill payment"),
            noop(),
        );
        let all = registry.search("账单", 5, None);
        assert_eq!(all.len(), 2);
        let receptionist = registry.search("账单", 5, Some("receptionist"));
        assert_eq!(receptionist.len(), 1);
        assert_eq!(receptionist[0].action, "add_payment");
        assert_eq!(registry.visible_to("receptionist").count(), 1);
    }
}
