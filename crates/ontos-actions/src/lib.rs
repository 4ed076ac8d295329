//! Action registry and dispatch.
//!
//! Actions are registered at startup as metadata plus a handler
//! ([`ActionRegistry::add`]). [`Dispatcher::dispatch`] runs the whole
//! pipeline for one invocation: lookup, schema validation, role and
//! permission checks, attribute write ACL, reference resolution within the
//! caller's data scope, constraints, the handler, snapshot capture, commit,
//! event publication and audit.

pub mod discovery;
pub mod dispatch;
pub mod handler;
pub mod registry;
pub mod validate;

pub use discovery::{SearchHit, SemanticIndex};
pub use dispatch::{DispatchServices, Dispatcher, PreparedAction};
pub use handler::{ActionEnv, ActionHandler, FnAction};
pub use registry::{ActionRegistry, RegisteredAction};
pub use validate::{Params, missing_required, validate_params};
