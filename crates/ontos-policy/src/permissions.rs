//! Role permissions with a per-user resolution cache.
//!
//! A permission is `resource:action`; either side may be `*` or end in `*`
//! for a prefix match. Resolved permission sets are cached per user until
//! `invalidate_user`/`invalidate_all` is called.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;
use ontos_protocol::{OntosError, OntosResult, ScopeLevel, SecurityLevel, UserContext};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Highest property security level the role may read and write.
    #[serde(default)]
    pub clearance: SecurityLevel,
    #[serde(default)]
    pub scope: ScopeLevel,
}

impl RoleDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            permissions: Vec::new(),
            clearance: SecurityLevel::Public,
            scope: ScopeLevel::ScopeOnly,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn allow<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn clearance(mut self, level: SecurityLevel) -> Self {
        self.clearance = level;
        self
    }

    pub fn scope(mut self, scope: ScopeLevel) -> Self {
        self.scope = scope;
        self
    }
}

fn segment_matches(pattern: &str, actual: &str) -> bool {
    if pattern.ends_with('*') {
        let prefix = pattern.trim_end_matches('*');
        prefix.is_empty() || actual.starts_with(prefix)
    } else {
        pattern == actual
    }
}

/// Whether a `resource:action` pattern grants `resource:action`.
pub fn permission_matches(pattern: &str, resource: &str, action: &str) -> bool {
    let (pattern_resource, pattern_action) = pattern.split_once(':').unwrap_or((pattern, "*"));
    segment_matches(pattern_resource, resource) && segment_matches(pattern_action, action)
}

#[derive(Debug, Default)]
pub struct PermissionChecker {
    roles: RwLock<HashMap<String, RoleDefinition>>,
    user_grants: RwLock<HashMap<String, Vec<String>>>,
    cache: RwLock<HashMap<String, Arc<IndexSet<String>>>>,
}

impl PermissionChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines or replaces a role. Cached sets are dropped, since any user
    /// may hold the role.
    pub fn define_role(&self, role: RoleDefinition) {
        self.roles.write().insert(role.name.clone(), role);
        self.invalidate_all();
    }

    pub fn role(&self, name: &str) -> Option<RoleDefinition> {
        self.roles.read().get(name).cloned()
    }

    pub fn roles(&self) -> Vec<RoleDefinition> {
        let mut roles: Vec<_> = self.roles.read().values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        roles
    }

    /// Extra permissions for a single user on top of their role.
    pub fn grant_user(&self, user_id: &str, permission: impl Into<String>) {
        self.user_grants
            .write()
            .entry(user_id.to_owned())
            .or_default()
            .push(permission.into());
        self.invalidate_user(user_id);
    }

    pub fn clearance(&self, role: &str) -> SecurityLevel {
        self.roles
            .read()
            .get(role)
            .map_or(SecurityLevel::Public, |r| r.clearance)
    }

    pub fn scope_level(&self, role: &str) -> ScopeLevel {
        self.roles
            .read()
            .get(role)
            .map_or(ScopeLevel::SelfOnly, |r| r.scope)
    }

    pub fn permissions_for(&self, user: &UserContext) -> Arc<IndexSet<String>> {
        if let Some(cached) = self.cache.read().get(&user.user_id) {
            return Arc::clone(cached);
        }
        let mut resolved = IndexSet::new();
        if let Some(role) = self.roles.read().get(&user.role) {
            resolved.extend(role.permissions.iter().cloned());
        }
        if let Some(grants) = self.user_grants.read().get(&user.user_id) {
            resolved.extend(grants.iter().cloned());
        }
        let resolved = Arc::new(resolved);
        self.cache
            .write()
            .insert(user.user_id.clone(), Arc::clone(&resolved));
        debug!(user_id = %user.user_id, role = %user.role, count = resolved.len(), "resolved permissions");
        resolved
    }

    pub fn has_permission(&self, user: &UserContext, resource: &str, action: &str) -> bool {
        self.permissions_for(user)
            .iter()
            .any(|pattern| permission_matches(pattern, resource, action))
    }

    pub fn require(&self, user: &UserContext, resource: &str, action: &str) -> OntosResult<()> {
        if self.has_permission(user, resource, action) {
            Ok(())
        } else {
            Err(OntosError::PermissionDenied {
                role: user.role.clone(),
                operation: format!("{resource}:{action}"),
            })
        }
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.cache.write().remove(user_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.write().clear();
    }
}
