//! Business rules: constraint evaluation, the sandboxed expression language,
//! vocabulary tables and the state machine engine.

pub mod constraints;
pub mod expr;
pub mod state_machine;
pub mod vocabulary;

pub use constraints::{ConditionFn, ConstraintEngine, ConstraintOutcome, ConstraintReport, RuleContext};
pub use expr::{ExprError, Expression};
pub use state_machine::{StateMachineEngine, TransitionOutcome};
pub use vocabulary::{TermMatch, Vocabulary};
