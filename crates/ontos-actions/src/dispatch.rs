use std::sync::Arc;

use ontos_events::{AuditLog, EventBus};
use ontos_policy::SecurityLayer;
use ontos_protocol::{
    ActionContext, ActionResult, AffectedEntity, AuditRecord, ChangeType, DomainEvent,
    EntityStore, FieldError, OntosError, OntosResult, RowChange, StoreTransaction,
};
use ontos_registry::OntologyRegistry;
use ontos_rules::{ConstraintEngine, RuleContext, StateMachineEngine};
use ontos_snapshot::{CaptureRequest, SnapshotStore};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::handler::ActionEnv;
use crate::registry::{ActionRegistry, RegisteredAction};
use crate::validate::{Params, validate_params};

/// Collaborators the dispatcher is assembled from.
#[derive(Clone)]
pub struct DispatchServices {
    pub actions: Arc<ActionRegistry>,
    pub registry: Arc<OntologyRegistry>,
    pub constraints: Arc<ConstraintEngine>,
    pub security: Arc<SecurityLayer>,
    pub store: Arc<dyn EntityStore>,
    pub snapshots: SnapshotStore,
    pub events: Arc<EventBus>,
    pub audit: Arc<dyn AuditLog>,
}

/// Parameters that passed every pre-execution check.
#[derive(Debug, Clone)]
pub struct PreparedAction {
    pub action: String,
    pub params: Params,
}

struct Executed {
    result: ActionResult,
    events: Vec<DomainEvent>,
}

#[derive(Clone)]
pub struct Dispatcher {
    services: DispatchServices,
    state_machines: StateMachineEngine,
}

fn affected_from(changes: &[RowChange]) -> Vec<AffectedEntity> {
    changes
        .iter()
        .map(|c| {
            let change_type = match (&c.before, &c.after) {
                (None, _) => ChangeType::Created,
                (_, None) => ChangeType::Deleted,
                _ => ChangeType::Updated,
            };
            AffectedEntity::new(c.entity.clone(), c.id.clone(), change_type)
        })
        .collect()
}

impl Dispatcher {
    pub fn new(services: DispatchServices) -> Self {
        let state_machines = StateMachineEngine::new(services.registry.clone());
        Self {
            services,
            state_machines,
        }
    }

    pub fn services(&self) -> &DispatchServices {
        &self.services
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.services.actions
    }

    pub fn state_machines(&self) -> &StateMachineEngine {
        &self.state_machines
    }

    fn lookup(&self, name: &str) -> OntosResult<&RegisteredAction> {
        self.services
            .actions
            .get(name)
            .ok_or_else(|| OntosError::UnknownAction(name.to_owned()))
    }

    /// Schema validation and authorization, without touching state.
    fn authorize(&self, registered: &RegisteredAction, raw: &Value, ctx: &ActionContext) -> OntosResult<Params> {
        let meta = &registered.meta;
        let user = &ctx.user;

        let params = validate_params(meta, raw).map_err(|errors| OntosError::validation(&meta.name, errors))?;

        if !meta.allows_role(&user.role) {
            return Err(OntosError::PermissionDenied {
                role: user.role.clone(),
                operation: meta.name.clone(),
            });
        }
        self.services
            .security
            .check_action(user, &meta.entity, &meta.name)?;

        if let Some(entity) = self.services.registry.get_entity(&meta.entity) {
            let declared = meta
                .params
                .iter()
                .filter(|p| p.entity_ref.is_none())
                .map(|p| p.name.as_str())
                .filter(|name| params.contains_key(*name));
            self.services.security.check_write(user, entity, declared)?;
        }
        Ok(params)
    }

    /// Every `entity_ref` parameter must name an existing row the user can see.
    fn check_references(
        &self,
        registered: &RegisteredAction,
        params: &Params,
        ctx: &ActionContext,
        tx: &dyn StoreTransaction,
    ) -> OntosResult<()> {
        let mut errors = Vec::new();
        for spec in &registered.meta.params {
            let (Some(target), Some(id)) = (&spec.entity_ref, params.get(&spec.name).and_then(Value::as_str)) else {
                continue;
            };
            let visible = match tx.get(target, id)? {
                None => false,
                Some(row) => self
                    .services
                    .registry
                    .get_entity(target)
                    .is_none_or(|entity| self.services.security.row_visible(&ctx.user, entity, &row)),
            };
            if !visible {
                errors.push(FieldError::new(&spec.name, format!("{target} {id} not found")));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OntosError::validation(&registered.meta.name, errors))
        }
    }

    /// Runs every check `dispatch` would run before the handler, in a
    /// throwaway transaction. Used to vet an action before asking for
    /// confirmation.
    pub fn prepare(&self, name: &str, raw: &Value, ctx: &ActionContext) -> OntosResult<PreparedAction> {
        let registered = self.lookup(name)?;
        let params = self.authorize(registered, raw, ctx)?;
        let tx = self.services.store.begin();
        self.check_references(registered, &params, ctx, tx.as_ref())?;
        Ok(PreparedAction {
            action: name.to_owned(),
            params,
        })
    }

    fn execute(&self, name: &str, raw: &Value, ctx: &ActionContext) -> OntosResult<Executed> {
        let registered = self.lookup(name)?;
        let meta = &registered.meta;
        let params = self.authorize(registered, raw, ctx)?;

        let mut tx = self.services.store.begin();
        self.check_references(registered, &params, ctx, tx.as_ref())?;

        let mut env = ActionEnv {
            action: meta,
            params: &params,
            context: ctx,
            registry: &self.services.registry,
            state_machines: &self.state_machines,
            before: &Value::Null,
        };
        let before = registered.handler.load_context(&env, tx.as_ref())?;

        let rule_ctx = RuleContext::new(&meta.entity, &meta.name, Value::Object(params.clone()))
            .with_before(before.clone())
            .with_user(&ctx.user);
        self.services.constraints.check(&rule_ctx)?;

        env.before = &before;
        let mut result = registered.handler.execute(&env, tx.as_mut())?;
        if !result.success {
            debug!(action = %meta.name, message = %result.message, "handler declined, discarding writes");
            return Ok(Executed {
                result,
                events: Vec::new(),
            });
        }

        let changes = tx.changes();
        if result.affected.is_empty() {
            result.affected = affected_from(&changes);
        }
        if meta.undoable && !changes.is_empty() {
            let request = CaptureRequest::new(&meta.name, &ctx.user.user_id)
                .about(result.entity_type.clone(), result.entity_id.clone());
            let snapshot = self
                .services
                .snapshots
                .capture(tx.as_mut(), request, changes, ctx.now)?;
            result.snapshot_id = Some(snapshot.snapshot_id);
        }
        tx.commit()?;

        let mut payload = params;
        payload.extend(result.data.clone());
        let events = result
            .events
            .iter()
            .map(|event| {
                DomainEvent::new(event, &meta.name, &ctx.user.user_id)
                    .about(result.entity_type.clone(), result.entity_id.clone())
                    .with_payload(Value::Object(payload.clone()))
            })
            .collect();
        Ok(Executed { result, events })
    }

    /// Executes one action end to end.
    ///
    /// Business failures (validation, authorization, constraints, lifecycle)
    /// come back as a failed `ActionResult`. Infrastructure failures are
    /// returned as `Err` with nothing committed. Both are audited.
    #[instrument(skip(self, raw_params, ctx), fields(action = %name, user_id = %ctx.user.user_id, role = %ctx.user.role))]
    pub async fn dispatch(&self, name: &str, raw_params: Value, ctx: &ActionContext) -> OntosResult<ActionResult> {
        let outcome = self.execute(name, &raw_params, ctx);
        let result = match outcome {
            Ok(Executed { result, events }) => {
                for event in events {
                    self.services.events.publish(event).await;
                }
                if result.success {
                    info!(snapshot_id = ?result.snapshot_id, "action executed");
                }
                result
            }
            Err(err) if err.is_domain() => {
                debug!(error_code = err.error_code(), error = %err, "action rejected");
                ActionResult::failure(&err)
            }
            Err(err) => {
                error!(error = %err, "action failed");
                let record = AuditRecord::infrastructure_failure(
                    name,
                    &ctx.user.user_id,
                    &ctx.user.role,
                    raw_params,
                    err.to_string(),
                    err.error_code(),
                );
                self.record(record).await;
                return Err(err);
            }
        };

        let record = AuditRecord::from_result(name, &ctx.user.user_id, &ctx.user.role, raw_params, &result);
        self.record(record).await;
        Ok(result)
    }

    async fn record(&self, record: AuditRecord) {
        if let Err(error) = self.services.audit.append(&record).await {
            warn!(%error, action = %record.action, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnAction;
    use anyhow::Result;
    use ontos_events::{AuditQuery, MemoryAuditLog};
    use ontos_policy::RoleDefinition;
    use ontos_protocol::{
        ActionMetadata, ConstraintMetadata, EntityMetadata, ParamSpec, ParamType, PropertyMetadata,
        PropertyType, Row, SecurityLevel, StateMachineDef, TransitionDef, UserContext,
    };
    use ontos_store::MemoryEntityStore;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    struct Fixture {
        store: Arc<MemoryEntityStore>,
        audit: Arc<MemoryAuditLog>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Result<Fixture> {
        let store = Arc::new(MemoryEntityStore::new());
        store.seed(
            "Lamp",
            [
                row(json!({"id": "L1", "status": "off", "branch_id": "b1", "label": "desk"})),
                row(json!({"id": "L2", "status": "off", "branch_id": "b2", "label": "hall"})),
            ],
        )?;

        let mut registry = OntologyRegistry::new();
        registry.register_entity(
            EntityMetadata::new("Lamp", "lamps")
                .scoped_by("branch_id")
                .property(PropertyMetadata::new("label", PropertyType::String))
                .property(PropertyMetadata::new("serial", PropertyType::String).security(SecurityLevel::Restricted)),
        )?;
        registry.register_state_machine(
            StateMachineDef::new("Lamp", ["off", "on"], "off")
                .transition(TransitionDef::new("off", "on", "switch_on"))
                .transition(TransitionDef::new("on", "off", "switch_off")),
        )?;

        let mut constraints = ConstraintEngine::new();
        constraints.register(
            ConstraintMetadata::new("lamp_label", "Lamp", "switch_on", "标签不能为 broken")
                .expr("params.label != 'broken'")
                .suggest("换一盏灯"),
        );

        let mut security = SecurityLayer::new();
        security.org.add_unit("b1", None);
        security.org.add_unit("b2", None);
        security.define_role(RoleDefinition::new("operator").allow(["Lamp:*"]));
        security.define_role(RoleDefinition::new("viewer").allow(["Lamp:read"]));

        let mut actions = ActionRegistry::new();
        actions.add(
            ActionMetadata::new("switch_on", "Lamp")
                .param(ParamSpec::new("lamp_id", ParamType::String).required().refers_to("Lamp", ["label"]))
                .param(ParamSpec::new("label", ParamType::String))
                .undoable(),
            FnAction::new(|env, tx| {
                let id = env.str_param("lamp_id")?;
                env.transition(tx, "Lamp", id, "switch_on")?;
                Ok(ActionResult::ok("lamp on").with_entity("Lamp", id).emit("LAMP_ON"))
            }),
        )?;
        actions.add(
            ActionMetadata::new("set_serial", "Lamp")
                .param(ParamSpec::new("lamp_id", ParamType::String).required().refers_to("Lamp", ["label"]))
                .param(ParamSpec::new("serial", ParamType::String).required()),
            FnAction::new(|_, _| Ok(ActionResult::ok("unreachable"))),
        )?;
        actions.add(
            ActionMetadata::new("break_lamp", "Lamp").roles(["manager"]),
            FnAction::new(|_, _| Ok(ActionResult::ok("unreachable"))),
        )?;

        let audit = Arc::new(MemoryAuditLog::new());
        let dispatcher = Dispatcher::new(DispatchServices {
            actions: Arc::new(actions),
            registry: Arc::new(registry),
            constraints: Arc::new(constraints),
            security: Arc::new(security),
            store: store.clone(),
            snapshots: SnapshotStore::with_default_ttl(store.clone()),
            events: Arc::new(EventBus::default()),
            audit: audit.clone(),
        });
        Ok(Fixture { store, audit, dispatcher })
    }

    fn operator() -> ActionContext {
        ActionContext::new(UserContext::new("u1", "operator").in_scope("b1"))
    }

    #[tokio::test]
    async fn successful_dispatch_commits_snapshots_and_audits() -> Result<()> {
        let f = fixture()?;
        let mut events = f.dispatcher.services().events.receiver();
        let result = f.dispatcher.dispatch("switch_on", json!({"lamp_id": "L1"}), &operator()).await?;
        assert!(result.success, "{}", result.message);
        assert!(result.snapshot_id.is_some());
        assert_eq!(result.affected.len(), 1);
        assert_eq!(f.store.get("Lamp", "L1")?.map(|r| r["status"].clone()), Some(json!("on")));
        assert_eq!(events.recv().await?.name, "LAMP_ON");
        assert_eq!(f.audit.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_action_and_missing_fields_fail_softly() -> Result<()> {
        let f = fixture()?;
        let unknown = f.dispatcher.dispatch("fly", json!({}), &operator()).await?;
        assert_eq!(unknown.error_code.as_deref(), Some("UNKNOWN_ACTION"));

        let missing = f.dispatcher.dispatch("set_serial", json!({}), &operator()).await?;
        assert_eq!(missing.error_code.as_deref(), Some("VALIDATION_ERROR"));
        let fields: Vec<_> = missing.field_errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["lamp_id", "serial"]);
        Ok(())
    }

    #[tokio::test]
    async fn role_checks_block_without_mutation() -> Result<()> {
        let f = fixture()?;
        let denied = f.dispatcher.dispatch("break_lamp", json!({}), &operator()).await?;
        assert_eq!(denied.error_code.as_deref(), Some("PERMISSION_DENIED"));

        let viewer = ActionContext::new(UserContext::new("v1", "viewer").in_scope("b1"));
        let denied = f.dispatcher.dispatch("switch_on", json!({"lamp_id": "L1"}), &viewer).await?;
        assert_eq!(denied.error_code.as_deref(), Some("PERMISSION_DENIED"));
        assert_eq!(f.store.get("Lamp", "L1")?.map(|r| r["status"].clone()), Some(json!("off")));

        let severe = f
            .audit
            .query(&AuditQuery { only_failures: true, ..Default::default() })
            .await?;
        assert_eq!(severe.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn restricted_property_write_is_denied() -> Result<()> {
        let f = fixture()?;
        let result = f
            .dispatcher
            .dispatch("set_serial", json!({"lamp_id": "L1", "serial": "X"}), &operator())
            .await?;
        assert_eq!(result.error_code.as_deref(), Some("ATTRIBUTE_ACCESS_DENIED"));
        Ok(())
    }

    #[tokio::test]
    async fn out_of_scope_reference_looks_missing() -> Result<()> {
        let f = fixture()?;
        let result = f.dispatcher.dispatch("switch_on", json!({"lamp_id": "L2"}), &operator()).await?;
        assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
        assert_eq!(f.store.get("Lamp", "L2")?.map(|r| r["status"].clone()), Some(json!("off")));
        Ok(())
    }

    #[tokio::test]
    async fn constraint_and_transition_failures_carry_guidance() -> Result<()> {
        let f = fixture()?;
        let blocked = f
            .dispatcher
            .dispatch("switch_on", json!({"lamp_id": "L1", "label": "broken"}), &operator())
            .await?;
        assert_eq!(blocked.error_code.as_deref(), Some("CONSTRAINT_VIOLATION"));
        assert_eq!(blocked.message, "标签不能为 broken");
        assert_eq!(blocked.suggestion.as_deref(), Some("换一盏灯"));

        f.dispatcher.dispatch("switch_on", json!({"lamp_id": "L1"}), &operator()).await?;
        let again = f.dispatcher.dispatch("switch_on", json!({"lamp_id": "L1"}), &operator()).await?;
        assert_eq!(again.error_code.as_deref(), Some("INVALID_TRANSITION"));
        assert_eq!(again.valid_alternatives, vec!["switch_off"]);
        Ok(())
    }

    #[test]
    fn prepare_runs_checks_without_writing() -> Result<()> {
        let f = fixture()?;
        let prepared = f.dispatcher.prepare("switch_on", &json!({"lamp_id": "L1"}), &operator())?;
        assert_eq!(prepared.params["lamp_id"], json!("L1"));
        assert_eq!(f.store.get("Lamp", "L1")?.map(|r| r["status"].clone()), Some(json!("off")));
        Ok(())
    }
}
