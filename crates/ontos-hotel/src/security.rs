//! Hotel roles and the organisation tree they are scoped by.

use ontos_policy::{Access, RoleDefinition, SecurityLayer};
use ontos_protocol::{ScopeLevel, SecurityLevel};

use crate::ontology::GUEST;

pub const HEADQUARTERS: &str = "hq";
pub const BRANCHES: [&str; 2] = ["b1", "b2"];

pub fn roles() -> Vec<RoleDefinition> {
    vec![
        RoleDefinition::new("admin")
            .describe("系统管理员")
            .allow(["*:*"])
            .clearance(SecurityLevel::Restricted)
            .scope(ScopeLevel::All),
        RoleDefinition::new("manager")
            .describe("店长")
            .allow(["*:*"])
            .clearance(SecurityLevel::Confidential)
            .scope(ScopeLevel::ScopeAndBelow),
        RoleDefinition::new("receptionist")
            .describe("前台")
            .allow([
                "Room:read",
                "Room:update_room_status",
                "RoomType:read",
                "Guest:*",
                "Reservation:*",
                "StayRecord:*",
                "Bill:read",
                "Bill:add_payment",
                "Payment:read",
                "Task:read",
                "Task:create_task",
                "Task:assign_task",
                "Employee:read",
            ])
            .clearance(SecurityLevel::Internal)
            .scope(ScopeLevel::ScopeOnly),
        RoleDefinition::new("cleaner")
            .describe("保洁")
            .allow([
                "Task:read",
                "Task:start_task",
                "Task:complete_task",
                "Room:read",
                "Room:update_room_status",
            ])
            .clearance(SecurityLevel::Public)
            .scope(ScopeLevel::SelfOnly),
    ]
}

pub fn register(security: &mut SecurityLayer) {
    security.org.add_unit(HEADQUARTERS, None);
    for branch in BRANCHES {
        security.org.add_unit(branch, Some(HEADQUARTERS));
    }
    for role in roles() {
        security.define_role(role);
    }
    // Front desk registers guests' ID numbers but never reads them back.
    security
        .acl
        .set_override("receptionist", GUEST, "id_number", Access::Write, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_protocol::UserContext;

    #[test]
    fn cleaners_cannot_touch_bills() {
        let mut security = SecurityLayer::new();
        register(&mut security);
        let cleaner = UserContext::new("E003", "cleaner").in_scope("b1");
        assert!(security.check_action(&cleaner, "Task", "complete_task").is_ok());
        assert!(security.check_action(&cleaner, "Bill", "add_payment").is_err());

        let receptionist = UserContext::new("E002", "receptionist").in_scope("b1");
        assert!(security.check_action(&receptionist, "Bill", "add_payment").is_ok());
        assert_eq!(
            security.check_action(&receptionist, "Bill", "adjust_bill").unwrap_err().error_code(),
            "PERMISSION_DENIED"
        );
    }

    #[test]
    fn managers_see_every_branch_under_headquarters() {
        let mut security = SecurityLayer::new();
        register(&mut security);
        assert_eq!(security.org.subtree(HEADQUARTERS).len(), 3);
    }
}
