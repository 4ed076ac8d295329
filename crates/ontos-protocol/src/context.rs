//! Request-scoped context: who is acting and what they may see.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, TurnId};

/// The acting user as resolved by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    pub role: String,
    /// Organisational partition the user belongs to (branch, department).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            display_name: user_id.clone(),
            user_id,
            role: role.into(),
            scope_id: None,
        }
    }

    pub fn in_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// Breadth of rows a role may see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    All,
    ScopeAndBelow,
    #[default]
    ScopeOnly,
    SelfOnly,
}

/// Concrete visibility for one request. Computed, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataScopeContext {
    pub level: ScopeLevel,
    pub visible_scope_ids: BTreeSet<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_column: Option<String>,
}

impl DataScopeContext {
    pub fn unrestricted(user_id: impl Into<String>) -> Self {
        Self {
            level: ScopeLevel::All,
            visible_scope_ids: BTreeSet::new(),
            user_id: user_id.into(),
            owner_column: None,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.level == ScopeLevel::All
    }

    pub fn can_see_scope(&self, scope_id: &str) -> bool {
        self.is_unrestricted() || self.visible_scope_ids.contains(scope_id)
    }
}

/// Everything a dispatch needs to know about the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub user: UserContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    pub now: DateTime<Utc>,
}

impl ActionContext {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            session_id: None,
            turn_id: None,
            now: Utc::now(),
        }
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn in_turn(mut self, turn_id: TurnId) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}
