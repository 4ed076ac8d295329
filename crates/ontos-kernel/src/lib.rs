//! Composition root for the ontos action core.
//!
//! [`KernelBuilder`] assembles registry, rules, security, store, snapshots,
//! events, dispatcher, turn loop and scheduler from a [`KernelConfig`] and a
//! set of [`DomainPlugin`]s, then hands out an [`OntosKernel`] facade.

pub mod config;
pub mod plugin;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::FutureExt;
use ontos_actions::{ActionRegistry, DispatchServices, Dispatcher};
use ontos_events::{
    AuditLog, AuditQuery, EventBus, FileAuditLog, InAppChannel, MemoryAuditLog, NotificationService,
    WebhookChannel,
};
use ontos_policy::SecurityLayer;
use ontos_protocol::{
    ActionContext, ActionResult, AuditRecord, DomainEvent, EntityStore, JobSpec, JobTask, LlmPort, OntosError,
    OntosResult, OperationSnapshot, SchemaExport, SchedulerPort, SnapshotId, UserContext,
};
use ontos_registry::OntologyRegistry;
use ontos_rules::{ConstraintEngine, Vocabulary};
use ontos_runtime::{
    FallbackIntentStrategy, IntentStrategy, LlmGateway, LlmIntentStrategy, LoopConfig, OodaLoop, PlanLibrary,
    RuleIntentStrategy, SessionContext, TurnResponse,
};
use ontos_snapshot::{SnapshotStore, UndoOutcome};
use ontos_store::MemoryEntityStore;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

pub use config::KernelConfig;
pub use plugin::DomainPlugin;
pub use scheduler::TokioScheduler;

pub struct KernelBuilder {
    config: KernelConfig,
    plugins: Vec<Arc<dyn DomainPlugin>>,
    llm: Option<Arc<dyn LlmPort>>,
}

impl KernelBuilder {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            plugins: Vec::new(),
            llm: None,
        }
    }

    pub fn plugin(mut self, plugin: impl DomainPlugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Without an LLM the turn loop runs on keyword rules alone.
    pub fn llm(mut self, llm: Option<Arc<dyn LlmPort>>) -> Self {
        self.llm = llm;
        self
    }

    pub async fn build(self) -> Result<OntosKernel> {
        let config = self.config;

        let mut registry = OntologyRegistry::new().with_max_hops(config.max_relationship_hops);
        let mut actions = ActionRegistry::new();
        let mut constraints = ConstraintEngine::new();
        let mut vocabulary = Vocabulary::new();
        let mut security = SecurityLayer::new();
        for plugin in &self.plugins {
            plugin
                .register_ontology(&mut registry)
                .with_context(|| format!("plugin {} failed to register its ontology", plugin.name()))?;
            plugin
                .register_actions(&mut actions)
                .with_context(|| format!("plugin {} failed to register its actions", plugin.name()))?;
            plugin.register_rules(&mut constraints, &mut vocabulary);
            plugin.register_security(&mut security);
            info!(plugin = plugin.name(), "plugin registered");
        }
        for meta in actions.list() {
            registry.register_action(meta.clone());
        }

        let store = Arc::new(MemoryEntityStore::new());
        for plugin in &self.plugins {
            let mut tx = store.begin();
            plugin
                .seed(tx.as_mut())
                .with_context(|| format!("plugin {} failed to seed", plugin.name()))?;
            tx.commit().context("seed commit failed")?;
        }

        let audit: Arc<dyn AuditLog> = match &config.audit_log_path {
            Some(path) => Arc::new(FileAuditLog::new(path)),
            None => Arc::new(MemoryAuditLog::new()),
        };

        let notifications = Arc::new(NotificationService::new(Duration::from_millis(
            config.notification_timeout_ms,
        )));
        let in_app = Arc::new(InAppChannel::new());
        notifications.register(in_app.clone());
        if let Some(url) = &config.webhook_url {
            notifications.register(Arc::new(WebhookChannel::new(url.clone())));
        }

        let events = Arc::new(EventBus::new(config.event_buffer));
        let actions = Arc::new(actions);
        let registry = Arc::new(registry);
        let vocabulary = Arc::new(vocabulary);
        let dispatcher = Dispatcher::new(DispatchServices {
            actions: actions.clone(),
            registry: registry.clone(),
            constraints: Arc::new(constraints),
            security: Arc::new(security),
            store: store.clone(),
            snapshots: SnapshotStore::new(store.clone(), chrono::Duration::seconds(config.snapshot_ttl_secs)),
            events: events.clone(),
            audit: audit.clone(),
        });

        let mut plans = PlanLibrary::new();
        for plugin in &self.plugins {
            plugin.register_events(&events, &notifications);
            for template in plugin.plan_templates() {
                plans
                    .register(template, &actions)
                    .with_context(|| format!("plugin {} registered an invalid plan", plugin.name()))?;
            }
        }

        let rules = RuleIntentStrategy::new(actions.clone(), vocabulary.clone(), config.discovery_top_k);
        let gateway = LlmGateway::new(self.llm, Duration::from_millis(config.llm_timeout_ms));
        let llm_enabled = gateway.is_enabled();
        let strategy: Arc<dyn IntentStrategy> = if llm_enabled {
            let llm = LlmIntentStrategy::new(gateway.clone(), actions.clone(), &registry);
            Arc::new(FallbackIntentStrategy::new(llm, rules))
        } else {
            Arc::new(rules)
        };
        let ooda = OodaLoop::new(dispatcher.clone(), strategy, vocabulary)
            .with_gateway(gateway)
            .with_plans(plans)
            .with_confirmation(config.confirmation_policy.build())
            .with_config(LoopConfig {
                min_intent_confidence: config.min_intent_confidence,
                query_limit: config.query_limit,
            });

        let scheduler = Arc::new(TokioScheduler::new());
        for plugin in &self.plugins {
            for (spec, task) in plugin.scheduled_jobs(&dispatcher) {
                scheduler.add_job(spec, task).await?;
            }
        }
        if config.snapshot_purge_interval_secs > 0 {
            let spec = JobSpec::every("purge_expired_snapshots", config.snapshot_purge_interval_secs)
                .describe("drop snapshots past their undo horizon");
            scheduler.add_job(spec, purge_task(dispatcher.services().snapshots.clone())).await?;
        }

        info!(
            entities = registry.entities().count(),
            actions = actions.len(),
            llm = llm_enabled,
            "kernel ready"
        );
        Ok(OntosKernel {
            config: Arc::new(config),
            dispatcher,
            ooda,
            audit,
            in_app,
            notifications,
            scheduler,
        })
    }
}

fn purge_task(snapshots: SnapshotStore) -> JobTask {
    Arc::new(move || {
        let snapshots = snapshots.clone();
        async move {
            let purged = snapshots.purge_expired(Utc::now())?;
            if purged > 0 {
                info!(purged, "expired snapshots purged");
            }
            Ok::<(), OntosError>(())
        }
        .boxed()
    })
}

#[derive(Clone)]
pub struct OntosKernel {
    config: Arc<KernelConfig>,
    dispatcher: Dispatcher,
    ooda: OodaLoop,
    audit: Arc<dyn AuditLog>,
    in_app: Arc<InAppChannel>,
    notifications: Arc<NotificationService>,
    scheduler: Arc<TokioScheduler>,
}

impl OntosKernel {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.dispatcher.services().store
    }

    pub fn registry(&self) -> &OntologyRegistry {
        &self.dispatcher.services().registry
    }

    #[instrument(skip(self, name, params, ctx), fields(action = %name, user_id = %ctx.user.user_id))]
    pub async fn dispatch(&self, name: &str, params: serde_json::Value, ctx: &ActionContext) -> OntosResult<ActionResult> {
        self.dispatcher.dispatch(name, params, ctx).await
    }

    #[instrument(skip(self, text, session), fields(session_id = %session.session_id, user_id = %session.user.user_id))]
    pub async fn process_turn(&self, text: &str, session: &SessionContext) -> OntosResult<TurnResponse> {
        self.ooda.process_turn(text, session).await
    }

    pub fn export_schema(&self) -> SchemaExport {
        self.registry().export_schema()
    }

    #[instrument(skip(self, user), fields(snapshot_id = %id, user_id = %user.user_id))]
    pub async fn undo(&self, id: &SnapshotId, user: &UserContext) -> OntosResult<UndoOutcome> {
        self.reverse(id, user, false).await
    }

    /// Reverses the snapshot and every snapshot linked to it.
    #[instrument(skip(self, user), fields(snapshot_id = %id, user_id = %user.user_id))]
    pub async fn undo_cascade(&self, id: &SnapshotId, user: &UserContext) -> OntosResult<UndoOutcome> {
        self.reverse(id, user, true).await
    }

    async fn reverse(&self, id: &SnapshotId, user: &UserContext, cascade: bool) -> OntosResult<UndoOutcome> {
        let action = if cascade { "undo_cascade" } else { "undo" };
        let outcome = self.authorize_undo(id, user, cascade).and_then(|()| {
            let snapshots = &self.dispatcher.services().snapshots;
            if cascade {
                snapshots.undo_cascade(id, &user.user_id, Utc::now())
            } else {
                snapshots.undo(id, &user.user_id, Utc::now())
            }
        });

        let result = match &outcome {
            Ok(done) => ActionResult::ok(format!("已撤销 {} 个操作", done.undone.len()))
                .with_data("undone", json!(done.undone)),
            Err(error) => ActionResult::failure(error),
        };
        let mut record = AuditRecord::from_result(action, &user.user_id, &user.role, json!({ "snapshot_id": id }), &result);
        record.snapshot_id = Some(id.clone());
        if let Err(error) = self.audit.append(&record).await {
            warn!(%error, "audit append failed");
        }
        match &outcome {
            Ok(done) => info!(undone = done.undone.len(), "undo applied"),
            Err(error) => warn!(%error, "undo refused"),
        }
        outcome
    }

    /// The operator may undo their own work; anyone else needs `undo` on the
    /// entity. Either way every row the undo would restore must be inside the
    /// user's data scope, otherwise the snapshot is reported as not found.
    fn authorize_undo(&self, id: &SnapshotId, user: &UserContext, cascade: bool) -> OntosResult<()> {
        let services = self.dispatcher.services();
        let group = if cascade {
            services.snapshots.linked_group(id)?
        } else {
            vec![services.snapshots.get(id)?]
        };
        for snapshot in &group {
            if !self.snapshot_in_scope(snapshot, user) {
                return Err(OntosError::SnapshotNotFound(id.to_string()));
            }
        }
        for snapshot in &group {
            if snapshot.operator_id != user.user_id {
                let entity = snapshot.entity_type.as_deref().unwrap_or("*");
                services.security.check_action(user, entity, "undo")?;
            }
        }
        Ok(())
    }

    fn snapshot_in_scope(&self, snapshot: &OperationSnapshot, user: &UserContext) -> bool {
        let services = self.dispatcher.services();
        snapshot.changes.iter().all(|change| {
            let Some(entity) = services.registry.get_entity(&change.entity) else {
                return true;
            };
            change
                .before
                .iter()
                .chain(change.after.iter())
                .all(|row| services.security.row_visible(user, entity, row))
        })
    }

    pub async fn audit_trail(&self, query: &AuditQuery) -> OntosResult<Vec<AuditRecord>> {
        self.audit.query(query).await
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.dispatcher.services().security.permissions.invalidate_user(user_id);
    }

    pub fn invalidate_all(&self) {
        self.dispatcher.services().security.permissions.invalidate_all();
    }

    pub fn scheduler(&self) -> Arc<dyn SchedulerPort> {
        self.scheduler.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DomainEvent> {
        self.dispatcher.services().events.receiver()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.dispatcher.services().events
    }

    pub fn in_app(&self) -> &InAppChannel {
        &self.in_app
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_actions::FnAction;
    use ontos_policy::RoleDefinition;
    use ontos_protocol::{
        ActionMetadata, EntityMetadata, ParamSpec, ParamType, PropertyMetadata, PropertyType, Row,
        StateMachineDef, StoreTransaction, TransitionDef,
    };
    use serde_json::Value;

    struct Lamps;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    impl DomainPlugin for Lamps {
        fn name(&self) -> &str {
            "lamps"
        }

        fn register_ontology(&self, registry: &mut OntologyRegistry) -> OntosResult<()> {
            registry.register_entity(
                EntityMetadata::new("Lamp", "lamps")
                    .describe("灯 lamp")
                    .property(PropertyMetadata::new("name", PropertyType::String))
                    .property(PropertyMetadata::new("status", PropertyType::String)),
            )?;
            registry.register_state_machine(
                StateMachineDef::new("Lamp", ["off", "on"], "off")
                    .transition(TransitionDef::new("off", "on", "switch_on"))
                    .transition(TransitionDef::new("on", "off", "switch_off")),
            )
        }

        fn register_actions(&self, actions: &mut ActionRegistry) -> OntosResult<()> {
            actions.add(
                ActionMetadata::new("switch_on", "Lamp")
                    .describe("开灯 switch on")
                    .keywords(["开灯"])
                    .param(
                        ParamSpec::new("lamp_id", ParamType::String)
                            .required()
                            .refers_to("Lamp", ["name"])
                            .extract([r"(desk|floor)"]),
                    )
                    .undoable(),
                FnAction::new(|env, tx| {
                    let id = env.str_param("lamp_id")?;
                    env.transition(tx, "Lamp", id, "switch_on")?;
                    Ok(ActionResult::ok(format!("{id} on")).with_entity("Lamp", id))
                }),
            )
        }

        fn register_security(&self, security: &mut SecurityLayer) {
            security.define_role(RoleDefinition::new("user").allow(["Lamp:switch_on", "Lamp:read"]));
            security.define_role(RoleDefinition::new("admin").allow(["*:*"]));
        }

        fn seed(&self, tx: &mut dyn StoreTransaction) -> OntosResult<()> {
            tx.insert("Lamp", row(json!({"id": "L1", "name": "desk", "status": "off"})))?;
            Ok(())
        }
    }

    async fn kernel() -> Result<OntosKernel> {
        KernelBuilder::new(KernelConfig::default()).plugin(Lamps).build().await
    }

    #[tokio::test]
    async fn built_kernel_dispatches_and_exports_actions() -> Result<()> {
        let kernel = kernel().await?;
        let ctx = ActionContext::new(UserContext::new("u1", "user"));
        let result = kernel.dispatch("switch_on", json!({"lamp_id": "L1"}), &ctx).await?;
        assert!(result.success, "{}", result.message);

        let schema = kernel.export_schema();
        assert!(schema.actions.iter().any(|a| a.name == "switch_on"));
        assert_eq!(kernel.scheduler().get_jobs().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn undo_is_audited_and_restricted_to_operator_or_undo_permission() -> Result<()> {
        let kernel = kernel().await?;
        let owner = UserContext::new("u1", "user");
        let result = kernel
            .dispatch("switch_on", json!({"lamp_id": "L1"}), &ActionContext::new(owner.clone()))
            .await?;
        let Some(snapshot_id) = result.snapshot_id else {
            anyhow::bail!("switch_on should be undoable");
        };

        let stranger = UserContext::new("u2", "user");
        let denied = kernel.undo(&snapshot_id, &stranger).await;
        assert_eq!(denied.map(|_| ()).unwrap_err().error_code(), "PERMISSION_DENIED");

        let outcome = kernel.undo(&snapshot_id, &owner).await?;
        assert_eq!(outcome.undone, vec![snapshot_id.clone()]);
        let state = kernel.store().get("Lamp", "L1")?.and_then(|r| r.get("status").cloned());
        assert_eq!(state, Some(json!("off")));

        let trail = kernel
            .audit_trail(&AuditQuery {
                action: Some("undo".into()),
                ..AuditQuery::default()
            })
            .await?;
        assert_eq!(trail.len(), 2);
        assert!(trail[0].success);
        assert!(!trail[1].success);
        Ok(())
    }

    #[tokio::test]
    async fn turns_run_on_rules_without_llm() -> Result<()> {
        let kernel = kernel().await?;
        let session = SessionContext::new("s1", UserContext::new("u1", "user"));
        let response = kernel.process_turn("帮我开灯 desk", &session).await?;
        assert!(response.trace.llm_calls.is_empty());
        assert_eq!(response.results.first().map(|r| r.success), Some(true));
        Ok(())
    }
}
