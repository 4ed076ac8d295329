//! # ontos-protocol: shared contract of the ontology action core
//!
//! Metadata types, action results, snapshots, audit records, domain events,
//! the error taxonomy and the capability ports every other ontos crate
//! depends on.
//!
//! It is intentionally dependency-light (no tokio, axum or storage engine) so
//! it can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (SnapshotId, SessionId, TurnId, PlanId, etc.)
//! - [`metadata`]: Entities, properties, relationships, interfaces, actions, state machines, constraints
//! - [`result`]: ActionResult, AffectedEntity
//! - [`context`]: UserContext, ActionContext, DataScopeContext
//! - [`event`]: DomainEvent
//! - [`snapshot`]: OperationSnapshot, RowChange, Row
//! - [`audit`]: AuditRecord, AuditSeverity
//! - [`ports`]: Store, LLM, notification and scheduler ports
//! - [`error`]: OntosError, OntosResult

pub mod audit;
pub mod context;
pub mod error;
pub mod event;
pub mod ids;
pub mod metadata;
pub mod ports;
pub mod result;
pub mod snapshot;

// Re-export the most commonly used types at the crate root.
pub use audit::{AuditRecord, AuditSeverity};
pub use context::{ActionContext, DataScopeContext, ScopeLevel, UserContext};
pub use error::{FieldError, OntosError, OntosResult};
pub use event::DomainEvent;
pub use ids::{AuditId, ConfirmationId, EventId, JobId, PlanId, SessionId, SnapshotId, TurnId};
pub use metadata::{
    ActionMetadata, Cardinality, ConstraintMetadata, DataScopeType, EntityMetadata,
    InterfaceDefinition, InterfaceExport, ParamSpec, ParamType, PropertyMetadata, PropertyType,
    RelationshipMetadata, RiskLevel, SchemaExport, SecurityLevel, SemanticType, Severity,
    StateMachineDef, TransitionDef,
};
pub use ports::{
    EntityStore, JobFuture, JobInfo, JobSpec, JobTask, LlmPort, LlmRequest, LlmResponse,
    NotificationChannel, RowFilter, SYSTEM_TABLE_PREFIX, SchedulerPort, StoreTransaction, loose_eq,
    row_id,
};
pub use result::{ActionResult, AffectedEntity, ChangeType};
pub use snapshot::{OperationSnapshot, Row, RowChange};
