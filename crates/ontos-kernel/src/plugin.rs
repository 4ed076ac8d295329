use std::sync::Arc;

use ontos_actions::{ActionRegistry, Dispatcher};
use ontos_events::{EventBus, NotificationService};
use ontos_policy::SecurityLayer;
use ontos_protocol::{JobSpec, JobTask, OntosResult, StoreTransaction};
use ontos_registry::OntologyRegistry;
use ontos_rules::{ConstraintEngine, Vocabulary};
use ontos_runtime::PlanTemplate;

/// A business domain contributed to the kernel.
///
/// The builder calls the hooks in declaration order: ontology first, so
/// actions, rules and roles can refer to the entities it registered. Hooks
/// other than `name` and `register_ontology` default to no-ops.
pub trait DomainPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn register_ontology(&self, registry: &mut OntologyRegistry) -> OntosResult<()>;

    fn register_actions(&self, _actions: &mut ActionRegistry) -> OntosResult<()> {
        Ok(())
    }

    fn register_rules(&self, _constraints: &mut ConstraintEngine, _vocabulary: &mut Vocabulary) {}

    /// Subscribe handlers. Runs after the dispatcher exists, before any dispatch.
    fn register_events(&self, _events: &EventBus, _notifications: &Arc<NotificationService>) {}

    fn register_security(&self, _security: &mut SecurityLayer) {}

    fn plan_templates(&self) -> Vec<PlanTemplate> {
        Vec::new()
    }

    /// Initial rows, written in one transaction before the kernel serves.
    fn seed(&self, _tx: &mut dyn StoreTransaction) -> OntosResult<()> {
        Ok(())
    }

    fn scheduled_jobs(&self, _dispatcher: &Dispatcher) -> Vec<(JobSpec, JobTask)> {
        Vec::new()
    }
}
