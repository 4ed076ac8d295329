//! Typed identifiers used across the action core.
//!
//! IDs are opaque String wrappers (serde-transparent). Fresh values are UUID v4;
//! row ids supplied by a store are accepted verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Identifier of an operation snapshot.
    SnapshotId
);
typed_id!(
    /// Identifier of a published domain event.
    EventId
);
typed_id!(
    /// Identifier of a conversational session.
    SessionId
);
typed_id!(
    /// Identifier of a single user turn through the OODA loop.
    TurnId
);
typed_id!(
    /// Identifier of an expanded execution plan.
    PlanId
);
typed_id!(
    /// Identifier of an audit record.
    AuditId
);
typed_id!(
    /// Identifier of a pending confirmation request.
    ConfirmationId
);
typed_id!(
    /// Identifier of a scheduled job.
    JobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_id_new_is_unique() {
        let a = SnapshotId::new_uuid();
        let b = SnapshotId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_from_string() {
        let id = SessionId::from_string("front-desk-1");
        assert_eq!(id.as_str(), "front-desk-1");
        assert_eq!(id.to_string(), "front-desk-1");
    }

    #[test]
    fn typed_id_serializes_transparently() {
        let id = TurnId::from_string("T1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"T1\"");
        let back: TurnId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn typed_id_hash_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(PlanId::from("same"));
        assert!(set.contains(&PlanId::from_string("same")));
    }
}
