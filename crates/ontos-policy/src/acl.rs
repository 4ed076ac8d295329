//! Attribute-level access control.
//!
//! A role may read or write a property iff the property's security level is at
//! most the role's clearance, unless an explicit override says otherwise.

use std::collections::HashMap;

use ontos_protocol::{EntityMetadata, OntosError, OntosResult, SecurityLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

impl Access {
    fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

type OverrideKey = (String, String, String, Access);

#[derive(Debug, Clone, Default)]
pub struct AttributeAcl {
    overrides: HashMap<OverrideKey, bool>,
}

impl AttributeAcl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicitly allows or denies `role` the given access to `entity.property`.
    pub fn set_override(&mut self, role: &str, entity: &str, property: &str, access: Access, allowed: bool) {
        self.overrides.insert(
            (role.to_owned(), entity.to_owned(), property.to_owned(), access),
            allowed,
        );
    }

    pub fn is_allowed(
        &self,
        role: &str,
        clearance: SecurityLevel,
        entity: &EntityMetadata,
        property: &str,
        access: Access,
    ) -> bool {
        let key = (role.to_owned(), entity.name.clone(), property.to_owned(), access);
        if let Some(allowed) = self.overrides.get(&key) {
            return *allowed;
        }
        entity
            .get_property(property)
            .is_none_or(|p| p.security_level <= clearance)
    }

    pub fn require(
        &self,
        role: &str,
        clearance: SecurityLevel,
        entity: &EntityMetadata,
        property: &str,
        access: Access,
    ) -> OntosResult<()> {
        if self.is_allowed(role, clearance, entity, property, access) {
            Ok(())
        } else {
            Err(OntosError::AttributeAccessDenied {
                entity: entity.name.clone(),
                property: property.to_owned(),
                access: access.as_str().to_owned(),
            })
        }
    }

    pub fn readable_properties<'a>(
        &'a self,
        role: &'a str,
        clearance: SecurityLevel,
        entity: &'a EntityMetadata,
    ) -> impl Iterator<Item = &'a str> + 'a {
        entity
            .properties
            .iter()
            .filter(move |p| self.is_allowed(role, clearance, entity, &p.name, Access::Read))
            .map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_protocol::{PropertyMetadata, PropertyType, SemanticType};

    fn guest() -> EntityMetadata {
        EntityMetadata::new("Guest", "guests")
            .property(PropertyMetadata::new("name", PropertyType::String).security(SecurityLevel::Internal))
            .property(
                PropertyMetadata::new("id_number", PropertyType::String)
                    .semantic(SemanticType::IdNumber)
                    .security(SecurityLevel::Restricted),
            )
            .property(PropertyMetadata::new("tier", PropertyType::String))
    }

    #[test]
    fn clearance_bounds_access() {
        let acl = AttributeAcl::new();
        let guest = guest();
        assert!(acl.is_allowed("receptionist", SecurityLevel::Confidential, &guest, "name", Access::Write));
        let err = acl
            .require("receptionist", SecurityLevel::Confidential, &guest, "id_number", Access::Write)
            .unwrap_err();
        assert_eq!(err.error_code(), "ATTRIBUTE_ACCESS_DENIED");
    }

    #[test]
    fn override_beats_clearance() {
        let mut acl = AttributeAcl::new();
        acl.set_override("receptionist", "Guest", "id_number", Access::Write, true);
        acl.set_override("cleaner", "Guest", "tier", Access::Read, false);
        let guest = guest();
        assert!(acl.is_allowed("receptionist", SecurityLevel::Internal, &guest, "id_number", Access::Write));
        let readable: Vec<_> = acl.readable_properties("cleaner", SecurityLevel::Internal, &guest).collect();
        assert_eq!(readable, vec!["name"]);
    }

    #[test]
    fn undeclared_property_is_not_gated() {
        let acl = AttributeAcl::new();
        assert!(acl.is_allowed("cleaner", SecurityLevel::Public, &guest(), "note", Access::Write));
    }
}
