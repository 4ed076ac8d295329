//! Security layer for the action core.
//!
//! Four independent concerns, composed by [`SecurityLayer`] on every entity
//! read and write:
//!
//! - [`permissions`]: role `resource:action` grants (hard `PermissionDenied`)
//! - [`acl`]: per-property clearance checks (hard `AttributeAccessDenied`)
//! - [`scope`]: data-scope narrowing (silent)
//! - [`masking`]: outward redaction of sensitive values (never mutates data)
//!
//! [`hitl`] holds the confirmation policies and the pending-confirmation queue.

pub mod acl;
pub mod hitl;
pub mod masking;
pub mod permissions;
pub mod scope;

pub use acl::{Access, AttributeAcl};
pub use hitl::{
    AlwaysConfirm, CompositePolicy, ConfirmByRisk, ConfirmByThreshold, ConfirmationPolicy,
    ConfirmationPolicyConfig, ConfirmationResolution, PendingConfirmation, PendingConfirmations,
};
pub use masking::{Visibility, mask_row, mask_text, visibility};
pub use permissions::{PermissionChecker, RoleDefinition, permission_matches};
pub use scope::{OrgTree, resolve_scope, row_visible, scope_filters};

use ontos_protocol::{
    DataScopeContext, EntityMetadata, OntosResult, Row, RowFilter, SecurityLevel, UserContext,
};

#[derive(Debug, Default)]
pub struct SecurityLayer {
    pub permissions: PermissionChecker,
    pub acl: AttributeAcl,
    pub org: OrgTree,
}

impl SecurityLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_role(&mut self, role: RoleDefinition) {
        self.permissions.define_role(role);
    }

    pub fn clearance(&self, user: &UserContext) -> SecurityLevel {
        self.permissions.clearance(&user.role)
    }

    pub fn check_action(&self, user: &UserContext, entity: &str, action: &str) -> OntosResult<()> {
        self.permissions.require(user, entity, action)
    }

    /// Every field in `fields` that names a property of `entity` must be
    /// writable by the user.
    pub fn check_write<'a>(
        &self,
        user: &UserContext,
        entity: &EntityMetadata,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> OntosResult<()> {
        let clearance = self.clearance(user);
        for field in fields {
            self.acl.require(&user.role, clearance, entity, field, Access::Write)?;
        }
        Ok(())
    }

    pub fn data_scope(&self, user: &UserContext, entity: &EntityMetadata) -> DataScopeContext {
        resolve_scope(
            &self.org,
            user,
            self.permissions.scope_level(&user.role),
            Some(entity),
        )
    }

    pub fn row_visible(&self, user: &UserContext, entity: &EntityMetadata, row: &Row) -> bool {
        row_visible(&self.data_scope(user, entity), entity, row)
    }

    pub fn scope_filters(&self, user: &UserContext, entity: &EntityMetadata) -> Vec<RowFilter> {
        scope_filters(&self.data_scope(user, entity), entity)
    }

    /// Outward view of a row: unreadable properties dropped, the rest masked.
    pub fn project_row(&self, user: &UserContext, entity: &EntityMetadata, mut row: Row) -> Row {
        let clearance = self.clearance(user);
        for property in &entity.properties {
            if !self
                .acl
                .is_allowed(&user.role, clearance, entity, &property.name, Access::Read)
            {
                row.remove(&property.name);
            }
        }
        mask_row(clearance, entity, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_protocol::{PropertyMetadata, PropertyType, ScopeLevel, SemanticType};
    use serde_json::json;

    fn layer() -> SecurityLayer {
        let mut layer = SecurityLayer::new();
        layer.org.add_unit("hq", None);
        layer.org.add_unit("b1", Some("hq"));
        layer.define_role(
            RoleDefinition::new("receptionist")
                .allow(["Guest:*"])
                .clearance(SecurityLevel::Confidential)
                .scope(ScopeLevel::ScopeOnly),
        );
        layer
    }

    fn guest() -> EntityMetadata {
        EntityMetadata::new("Guest", "guests")
            .scoped_by("branch_id")
            .property(PropertyMetadata::new("name", PropertyType::String))
            .property(
                PropertyMetadata::new("phone", PropertyType::String)
                    .semantic(SemanticType::Phone)
                    .security(SecurityLevel::Confidential),
            )
            .property(PropertyMetadata::new("blacklist_reason", PropertyType::String).security(SecurityLevel::Restricted))
    }

    #[test]
    fn projection_drops_unreadable_and_masks_equal_level() {
        let user = UserContext::new("r1", "receptionist").in_scope("b1");
        let row = json!({"id": "G1", "branch_id": "b1", "name": "Bob", "phone": "13900001111", "blacklist_reason": "x"})
            .as_object()
            .cloned()
            .unwrap_or_default();
        let projected = layer().project_row(&user, &guest(), row);
        assert_eq!(projected["phone"], "139****1111");
        assert!(!projected.contains_key("blacklist_reason"));
        assert_eq!(projected["name"], "Bob");
    }

    #[test]
    fn write_check_covers_every_named_field() {
        let user = UserContext::new("r1", "receptionist").in_scope("b1");
        let layer = layer();
        assert!(layer.check_write(&user, &guest(), ["name", "phone"]).is_ok());
        assert!(layer.check_write(&user, &guest(), ["name", "blacklist_reason"]).is_err());
    }

    #[test]
    fn unknown_role_sees_only_own_partition() {
        let user = UserContext::new("x1", "visitor").in_scope("b1");
        let scope = layer().data_scope(&user, &guest());
        assert_eq!(scope.level, ScopeLevel::SelfOnly);
        assert!(layer().check_action(&user, "Guest", "read").is_err());
    }
}
