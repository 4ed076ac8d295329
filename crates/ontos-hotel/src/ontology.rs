//! Hotel entities, relationships and lifecycles.

use ontos_protocol::{
    Cardinality, EntityMetadata, InterfaceDefinition, OntosResult, PropertyMetadata, PropertyType,
    RelationshipMetadata, SecurityLevel, SemanticType, StateMachineDef, TransitionDef,
};
use ontos_registry::OntologyRegistry;

pub const BRANCH: &str = "Branch";
pub const ROOM_TYPE: &str = "RoomType";
pub const ROOM: &str = "Room";
pub const GUEST: &str = "Guest";
pub const RESERVATION: &str = "Reservation";
pub const STAY: &str = "StayRecord";
pub const BILL: &str = "Bill";
pub const PAYMENT: &str = "Payment";
pub const TASK: &str = "Task";
pub const EMPLOYEE: &str = "Employee";

/// Column every branch-owned row carries.
pub const BRANCH_COLUMN: &str = "branch_id";

fn text(name: &str) -> PropertyMetadata {
    PropertyMetadata::new(name, PropertyType::String)
}

fn money(name: &str) -> PropertyMetadata {
    PropertyMetadata::new(name, PropertyType::Number).semantic(SemanticType::Money)
}

fn date(name: &str) -> PropertyMetadata {
    PropertyMetadata::new(name, PropertyType::Date)
}

fn status<const N: usize>(values: [&str; N]) -> PropertyMetadata {
    PropertyMetadata::new("status", PropertyType::Enum)
        .semantic(SemanticType::Status)
        .enum_values(values)
        .required()
}

fn branch_ref() -> PropertyMetadata {
    text(BRANCH_COLUMN).references(BRANCH).required()
}

pub const ROOM_STATES: [&str; 4] = ["vacant_clean", "vacant_dirty", "occupied", "out_of_order"];
pub const RESERVATION_STATES: [&str; 6] = ["pending", "confirmed", "checked_in", "cancelled", "no_show", "completed"];
pub const STAY_STATES: [&str; 2] = ["active", "checked_out"];
pub const TASK_STATES: [&str; 4] = ["pending", "assigned", "in_progress", "completed"];
pub const BILL_STATES: [&str; 2] = ["open", "settled"];

fn entities() -> Vec<EntityMetadata> {
    vec![
        EntityMetadata::new(BRANCH, "branches")
            .describe("门店 分店 branch")
            .property(text("name").required()),
        EntityMetadata::new(ROOM_TYPE, "room_types")
            .describe("房型 room type")
            .property(text("name").required().unique())
            .property(money("base_price").required()),
        EntityMetadata::new(ROOM, "rooms")
            .describe("房间 客房 房态 room")
            .aggregate_root()
            .scoped_by(BRANCH_COLUMN)
            .lifecycle(ROOM_STATES)
            .property(text("room_number").required())
            .property(PropertyMetadata::new("floor", PropertyType::Integer))
            .property(text("room_type_id").references(ROOM_TYPE).required())
            .property(status(ROOM_STATES))
            .property(branch_ref()),
        EntityMetadata::new(GUEST, "guests")
            .describe("客人 住客 guest")
            .scoped_by(BRANCH_COLUMN)
            .property(text("name").required().semantic(SemanticType::PersonName))
            .property(
                text("phone")
                    .semantic(SemanticType::Phone)
                    .security(SecurityLevel::Internal),
            )
            .property(
                text("id_number")
                    .semantic(SemanticType::IdNumber)
                    .security(SecurityLevel::Confidential),
            )
            .property(branch_ref()),
        EntityMetadata::new(RESERVATION, "reservations")
            .describe("预订 预约 reservation booking")
            .aggregate_root()
            .scoped_by(BRANCH_COLUMN)
            .lifecycle(RESERVATION_STATES)
            .property(text("reservation_no").required().unique())
            .property(text("guest_id").references(GUEST))
            .property(text("guest_name").semantic(SemanticType::PersonName))
            .property(text("room_type_id").references(ROOM_TYPE))
            .property(text("room_id").references(ROOM))
            .property(date("check_in_date").required())
            .property(date("check_out_date").required())
            .property(status(RESERVATION_STATES))
            .property(branch_ref()),
        EntityMetadata::new(STAY, "stay_records")
            .describe("住宿 在住 入住记录 stay")
            .aggregate_root()
            .scoped_by(BRANCH_COLUMN)
            .lifecycle(STAY_STATES)
            .property(text("guest_id").references(GUEST).required())
            .property(text("guest_name").semantic(SemanticType::PersonName))
            .property(text("room_id").references(ROOM).required())
            .property(text("room_number"))
            .property(text("reservation_id").references(RESERVATION))
            .property(money("nightly_rate"))
            .property(PropertyMetadata::new("check_in_time", PropertyType::DateTime))
            .property(date("expected_check_out"))
            .property(PropertyMetadata::new("check_out_time", PropertyType::DateTime))
            .property(status(STAY_STATES))
            .property(branch_ref()),
        EntityMetadata::new(BILL, "bills")
            .describe("账单 bill")
            .scoped_by(BRANCH_COLUMN)
            .lifecycle(BILL_STATES)
            .property(text("stay_record_id").references(STAY).required())
            .property(text("room_number"))
            .property(money("total_amount").required())
            .property(money("paid_amount").required())
            .property(money("adjustment_amount").security(SecurityLevel::Internal))
            .property(money("outstanding_amount"))
            .property(date("last_charged_date"))
            .property(status(BILL_STATES))
            .property(branch_ref()),
        EntityMetadata::new(PAYMENT, "payments")
            .describe("付款 收款 押金 payment")
            .scoped_by(BRANCH_COLUMN)
            .property(text("bill_id").references(BILL).required())
            .property(money("amount").required())
            .property(text("method").enum_values(["cash", "card", "wechat", "alipay"]))
            .property(text("received_by"))
            .property(PropertyMetadata::new("received_at", PropertyType::DateTime))
            .property(branch_ref()),
        EntityMetadata::new(TASK, "tasks")
            .describe("任务 清洁 保洁 维修 task")
            .scoped_by(BRANCH_COLUMN)
            .owned_by("assignee_id")
            .lifecycle(TASK_STATES)
            .property(text("room_id").references(ROOM).required())
            .property(text("room_number"))
            .property(text("task_type").enum_values(["cleaning", "maintenance"]))
            .property(text("assignee_id").references(EMPLOYEE))
            .property(text("notes"))
            .property(status(TASK_STATES))
            .property(branch_ref()),
        EntityMetadata::new(EMPLOYEE, "employees")
            .describe("员工 employee staff")
            .scoped_by(BRANCH_COLUMN)
            .property(text("name").required().semantic(SemanticType::PersonName))
            .property(text("role").required())
            .property(
                text("phone")
                    .semantic(SemanticType::Phone)
                    .security(SecurityLevel::Confidential),
            )
            .property(branch_ref()),
    ]
}

fn relationships() -> Vec<RelationshipMetadata> {
    use Cardinality::*;
    vec![
        RelationshipMetadata::new("room_type", ROOM, ROOM_TYPE, ManyToOne, "room_type_id").inverse("rooms"),
        RelationshipMetadata::new("branch", ROOM, BRANCH, ManyToOne, BRANCH_COLUMN),
        RelationshipMetadata::new("guest", RESERVATION, GUEST, ManyToOne, "guest_id").inverse("reservations"),
        RelationshipMetadata::new("room", RESERVATION, ROOM, ManyToOne, "room_id"),
        RelationshipMetadata::new("guest", STAY, GUEST, ManyToOne, "guest_id").inverse("stays"),
        RelationshipMetadata::new("room", STAY, ROOM, ManyToOne, "room_id").inverse("stays"),
        RelationshipMetadata::new("reservation", STAY, RESERVATION, OneToOne, "reservation_id"),
        RelationshipMetadata::new("stay", BILL, STAY, OneToOne, "stay_record_id").inverse("bill"),
        RelationshipMetadata::new("bill", PAYMENT, BILL, ManyToOne, "bill_id").inverse("payments"),
        RelationshipMetadata::new("room", TASK, ROOM, ManyToOne, "room_id").inverse("tasks"),
        RelationshipMetadata::new("assignee", TASK, EMPLOYEE, ManyToOne, "assignee_id").inverse("tasks"),
        RelationshipMetadata::new("branch", EMPLOYEE, BRANCH, ManyToOne, BRANCH_COLUMN),
    ]
}

pub fn room_machine() -> StateMachineDef {
    StateMachineDef::new(ROOM, ROOM_STATES, "vacant_clean")
        .transition(TransitionDef::new("vacant_clean", "occupied", "check_in"))
        .transition(TransitionDef::new("occupied", "vacant_dirty", "check_out"))
        .transition(TransitionDef::new("vacant_dirty", "vacant_clean", "clean"))
        .transition(TransitionDef::new("vacant_clean", "vacant_dirty", "mark_dirty"))
        .transition(TransitionDef::new("vacant_clean", "out_of_order", "maintenance"))
        .transition(TransitionDef::new("vacant_dirty", "out_of_order", "maintenance"))
        .transition(TransitionDef::new("out_of_order", "vacant_dirty", "repair"))
}

pub fn reservation_machine() -> StateMachineDef {
    StateMachineDef::new(RESERVATION, RESERVATION_STATES, "pending")
        .finals(["cancelled", "completed"])
        .transition(TransitionDef::new("pending", "confirmed", "confirm"))
        .transition(TransitionDef::new("pending", "cancelled", "cancel"))
        .transition(TransitionDef::new("confirmed", "checked_in", "check_in"))
        .transition(TransitionDef::new("confirmed", "cancelled", "cancel"))
        .transition(TransitionDef::new("confirmed", "no_show", "mark_no_show"))
        .transition(TransitionDef::new("checked_in", "completed", "complete"))
}

pub fn stay_machine() -> StateMachineDef {
    StateMachineDef::new(STAY, STAY_STATES, "active")
        .finals(["checked_out"])
        .transition(TransitionDef::new("active", "checked_out", "check_out").emits(["GUEST_CHECKED_OUT"]))
}

pub fn bill_machine() -> StateMachineDef {
    StateMachineDef::new(BILL, BILL_STATES, "open")
        .finals(["settled"])
        .transition(TransitionDef::new("open", "settled", "settle"))
}

pub fn task_machine() -> StateMachineDef {
    StateMachineDef::new(TASK, TASK_STATES, "pending")
        .finals(["completed"])
        .transition(TransitionDef::new("pending", "assigned", "assign").when("params.assignee_id != null"))
        .transition(TransitionDef::new("pending", "in_progress", "start"))
        .transition(TransitionDef::new("assigned", "in_progress", "start"))
        .transition(TransitionDef::new("assigned", "completed", "complete").emits(["TASK_COMPLETED"]))
        .transition(TransitionDef::new("in_progress", "completed", "complete").emits(["TASK_COMPLETED"]))
}

pub fn register(registry: &mut OntologyRegistry) -> OntosResult<()> {
    for entity in entities() {
        registry.register_entity(entity)?;
    }
    for relationship in relationships() {
        let source = relationship.source.clone();
        registry.register_relationship(&source, relationship);
    }
    for machine in [
        room_machine(),
        reservation_machine(),
        stay_machine(),
        bill_machine(),
        task_machine(),
    ] {
        registry.register_state_machine(machine)?;
    }

    registry.register_interface(InterfaceDefinition {
        name: "Billable".into(),
        description: "carries money owed by a guest".into(),
        required_properties: vec!["total_amount".into(), "paid_amount".into(), "outstanding_amount".into()],
        required_actions: vec!["add_payment".into()],
    });
    registry.register_interface_implementation("Billable", BILL);
    registry.register_interface(InterfaceDefinition {
        name: "Assignable".into(),
        description: "work that can be handed to an employee".into(),
        required_properties: vec!["assignee_id".into(), "status".into()],
        required_actions: vec!["assign_task".into()],
    });
    registry.register_interface_implementation("Assignable", TASK);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ontos_rules::StateMachineEngine;

    use super::*;

    fn engine() -> anyhow::Result<StateMachineEngine> {
        let mut registry = OntologyRegistry::new();
        register(&mut registry)?;
        Ok(StateMachineEngine::new(Arc::new(registry)))
    }

    #[test]
    fn room_occupancy_needs_a_clean_room() -> anyhow::Result<()> {
        let machines = engine()?;
        assert!(machines.is_valid_transition(ROOM, "vacant_clean", "occupied"));
        assert!(!machines.is_valid_transition(ROOM, "vacant_dirty", "occupied"));
        assert!(!machines.is_valid_transition(ROOM, "out_of_order", "occupied"));
        assert_eq!(machines.valid_triggers(ROOM, "occupied"), ["check_out"]);
        Ok(())
    }

    #[test]
    fn stays_never_reopen() -> anyhow::Result<()> {
        let machines = engine()?;
        assert!(machines.is_valid_transition(STAY, "active", "checked_out"));
        assert!(!machines.is_valid_transition(STAY, "checked_out", "active"));
        assert!(machines.is_final(STAY, "checked_out"));
        assert!(machines.valid_triggers(STAY, "checked_out").is_empty());
        Ok(())
    }

    #[test]
    fn confirmed_reservations_fan_out() -> anyhow::Result<()> {
        let machines = engine()?;
        for to in ["checked_in", "cancelled", "no_show"] {
            assert!(machines.is_valid_transition(RESERVATION, "confirmed", to), "confirmed -> {to}");
        }
        assert!(!machines.is_valid_transition(RESERVATION, "cancelled", "confirmed"));
        for state in ["cancelled", "completed"] {
            assert!(machines.is_final(RESERVATION, state), "{state} is final");
            assert!(machines.valid_triggers(RESERVATION, state).is_empty());
        }
        Ok(())
    }

    #[test]
    fn tasks_allow_shortcuts_but_not_reopening() -> anyhow::Result<()> {
        let machines = engine()?;
        for (from, to) in [
            ("pending", "in_progress"),
            ("pending", "assigned"),
            ("assigned", "in_progress"),
            ("assigned", "completed"),
            ("in_progress", "completed"),
        ] {
            assert!(machines.is_valid_transition(TASK, from, to), "{from} -> {to}");
        }
        assert!(!machines.is_valid_transition(TASK, "completed", "pending"));
        assert!(machines.is_final(TASK, "completed"));
        Ok(())
    }

    #[test]
    fn no_state_loops_onto_itself() -> anyhow::Result<()> {
        let machines = engine()?;
        for (entity, states) in [
            (ROOM, &ROOM_STATES[..]),
            (RESERVATION, &RESERVATION_STATES[..]),
            (STAY, &STAY_STATES[..]),
            (TASK, &TASK_STATES[..]),
            (BILL, &BILL_STATES[..]),
        ] {
            for state in states {
                assert!(!machines.is_valid_transition(entity, state, state), "{entity} {state}");
            }
        }
        Ok(())
    }

    #[test]
    fn lifecycles_validate_and_paths_resolve() -> anyhow::Result<()> {
        let mut registry = OntologyRegistry::new();
        register(&mut registry)?;
        assert_eq!(registry.entities().count(), 10);
        assert_eq!(registry.get_implementations("Billable"), ["Bill".to_string()]);

        let path = registry.find_path(PAYMENT, ROOM).unwrap_or_default();
        let hops: Vec<&str> = path.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(hops, [BILL, STAY, ROOM]);
        Ok(())
    }
}
