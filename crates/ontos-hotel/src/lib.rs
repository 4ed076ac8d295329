//! Hotel property management on the ontos action core.
//!
//! [`HotelPlugin`] contributes the whole domain to a kernel: rooms, guests,
//! reservations, stays, bills and housekeeping tasks ([`ontology`]), the
//! front-desk, billing and housekeeping actions ([`actions`]), their business
//! rules and vocabulary ([`rules`]), notification routes ([`events`]), the four
//! staff roles ([`security`]), two multi-step workflows ([`plans`]) and the
//! nightly room-charge job ([`jobs`]).

pub mod actions;
pub mod events;
pub mod jobs;
pub mod ontology;
pub mod plans;
pub mod rules;
pub mod security;
pub mod seed;

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use ontos_actions::{ActionRegistry, Dispatcher};
use ontos_events::{EventBus, NotificationService};
use ontos_kernel::DomainPlugin;
use ontos_policy::SecurityLayer;
use ontos_protocol::{JobSpec, JobTask, OntosResult, StoreTransaction};
use ontos_registry::OntologyRegistry;
use ontos_rules::{ConstraintEngine, Vocabulary};
use ontos_runtime::PlanTemplate;

#[derive(Debug, Clone, Default)]
pub struct HotelPlugin {
    demo_data: bool,
    business_date: Option<NaiveDate>,
}

impl HotelPlugin {
    /// Domain only, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the demo property on build.
    pub fn with_demo_data(mut self) -> Self {
        self.demo_data = true;
        self
    }

    /// Pins the date the demo data is laid out around; today otherwise.
    pub fn on(mut self, date: NaiveDate) -> Self {
        self.business_date = Some(date);
        self
    }
}

impl DomainPlugin for HotelPlugin {
    fn name(&self) -> &str {
        "hotel"
    }

    fn register_ontology(&self, registry: &mut OntologyRegistry) -> OntosResult<()> {
        ontology::register(registry)
    }

    fn register_actions(&self, actions: &mut ActionRegistry) -> OntosResult<()> {
        actions::register(actions)
    }

    fn register_rules(&self, constraints: &mut ConstraintEngine, vocabulary: &mut Vocabulary) {
        rules::register(constraints, vocabulary);
    }

    fn register_events(&self, events: &EventBus, notifications: &Arc<NotificationService>) {
        events::register(events, notifications);
    }

    fn register_security(&self, security: &mut SecurityLayer) {
        security::register(security);
    }

    fn plan_templates(&self) -> Vec<PlanTemplate> {
        plans::templates()
    }

    fn seed(&self, tx: &mut dyn StoreTransaction) -> OntosResult<()> {
        if !self.demo_data {
            return Ok(());
        }
        let today = self.business_date.unwrap_or_else(|| Utc::now().date_naive());
        seed::seed(tx, today)
    }

    fn scheduled_jobs(&self, dispatcher: &Dispatcher) -> Vec<(JobSpec, JobTask)> {
        jobs::jobs(dispatcher)
    }
}
