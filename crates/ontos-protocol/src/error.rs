//! Error taxonomy for the action core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One violated field of a parameter schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn render_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised by the registry, dispatcher, engines and ports.
///
/// Domain errors (see [`OntosError::is_domain`]) are converted into a failed
/// `ActionResult` at the dispatch boundary. Infrastructure errors propagate.
#[derive(Debug, Clone, Error)]
pub enum OntosError {
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid parameters for {action}: {}", render_field_errors(.errors))]
    Validation {
        action: String,
        errors: Vec<FieldError>,
    },
    #[error("permission denied: role {role} may not {operation}")]
    PermissionDenied { role: String, operation: String },
    #[error("attribute access denied: {access} {entity}.{property}")]
    AttributeAccessDenied {
        entity: String,
        property: String,
        access: String,
    },
    #[error("{message}")]
    ConstraintViolation {
        constraint_id: String,
        message: String,
        suggestion: Option<String>,
        valid_alternatives: Vec<String>,
    },
    #[error("invalid transition for {entity}: no '{trigger}' from state '{from}'")]
    InvalidTransition {
        entity: String,
        from: String,
        trigger: String,
        valid_alternatives: Vec<String>,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot {snapshot_id} expired at {expired_at}")]
    SnapshotExpired {
        snapshot_id: String,
        expired_at: DateTime<Utc>,
    },
    #[error("snapshot already undone: {0}")]
    SnapshotAlreadyUndone(String),
    #[error("undo conflict on snapshot {snapshot_id}: {reason}")]
    UndoConflict { snapshot_id: String, reason: String },
    #[error("upstream unavailable: {service}: {reason}")]
    UpstreamUnavailable { service: String, reason: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl OntosError {
    pub fn validation(action: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self::Validation {
            action: action.into(),
            errors,
        }
    }

    pub fn constraint(
        constraint_id: impl Into<String>,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) -> Self {
        Self::ConstraintViolation {
            constraint_id: constraint_id.into(),
            message: message.into(),
            suggestion,
            valid_alternatives: Vec::new(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn upstream(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code carried by failed action results.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownAction(_) => "UNKNOWN_ACTION",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::AttributeAccessDenied { .. } => "ATTRIBUTE_ACCESS_DENIED",
            Self::ConstraintViolation { .. } => "CONSTRAINT_VIOLATION",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::SnapshotExpired { .. } => "SNAPSHOT_EXPIRED",
            Self::SnapshotAlreadyUndone(_) => "SNAPSHOT_ALREADY_UNDONE",
            Self::UndoConflict { .. } => "UNDO_CONFLICT",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the error is a business outcome rather than an infrastructure fault.
    pub fn is_domain(&self) -> bool {
        !matches!(
            self,
            Self::Configuration(_) | Self::Store(_) | Self::Internal(_)
        )
    }

    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::ConstraintViolation { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }

    pub fn valid_alternatives(&self) -> &[String] {
        match self {
            Self::ConstraintViolation {
                valid_alternatives, ..
            }
            | Self::InvalidTransition {
                valid_alternatives, ..
            } => valid_alternatives,
            _ => &[],
        }
    }

    /// Fields reported by a validation failure.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            Self::Validation { errors, .. } => errors,
            _ => &[],
        }
    }
}

/// Convenience result type for core operations.
pub type OntosResult<T> = Result<T, OntosError>;
