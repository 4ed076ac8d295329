//! Side-effect plumbing for the action core: the domain event bus, the
//! append-only audit trail and the notification channels event handlers use.

pub mod audit;
pub mod bus;
pub mod notify;

pub use audit::{AuditLog, AuditQuery, FileAuditLog, MemoryAuditLog};
pub use bus::{ALL_EVENTS, EventBus, EventHandler, FnHandler, PublishReport};
pub use notify::{InAppChannel, InAppMessage, NotificationService, WebhookChannel};
