//! Demo property: two branches under one headquarters, a handful of rooms,
//! staff for every role, one guest in house and one arriving today.

use chrono::{Duration, NaiveDate};
use ontos_protocol::{OntosResult, StoreTransaction};
use serde_json::{Value, json};
use tracing::debug;

use crate::actions::row;
use crate::ontology::{BILL, BRANCH, BRANCH_COLUMN, EMPLOYEE, GUEST, PAYMENT, RESERVATION, ROOM, ROOM_TYPE, STAY, TASK};

fn insert_all(tx: &mut dyn StoreTransaction, entity: &str, rows: Vec<Value>) -> OntosResult<usize> {
    let count = rows.len();
    for value in rows {
        tx.insert(entity, row(value))?;
    }
    Ok(count)
}

fn room(id: &str, number: &str, room_type: &str, status: &str, branch: &str) -> Value {
    let floor = number.chars().next().and_then(|c| c.to_digit(10)).unwrap_or(1);
    json!({
        "id": id,
        "room_number": number,
        "floor": floor,
        "room_type_id": room_type,
        "status": status,
        BRANCH_COLUMN: branch,
    })
}

/// Writes the demo rows. Dates are laid out around `today`.
pub fn seed(tx: &mut dyn StoreTransaction, today: NaiveDate) -> OntosResult<()> {
    insert_all(
        tx,
        BRANCH,
        vec![
            json!({"id": "hq", "name": "总部"}),
            json!({"id": "b1", "name": "西湖店"}),
            json!({"id": "b2", "name": "滨江店"}),
        ],
    )?;
    insert_all(
        tx,
        ROOM_TYPE,
        vec![
            json!({"id": "RT1", "name": "大床房", "base_price": 288.0}),
            json!({"id": "RT2", "name": "双床房", "base_price": 328.0}),
            json!({"id": "RT3", "name": "套房", "base_price": 588.0}),
        ],
    )?;
    let rooms = insert_all(
        tx,
        ROOM,
        vec![
            room("b1-101", "101", "RT1", "vacant_clean", "b1"),
            room("b1-102", "102", "RT1", "occupied", "b1"),
            room("b1-103", "103", "RT2", "vacant_dirty", "b1"),
            room("b1-201", "201", "RT2", "vacant_clean", "b1"),
            room("b1-202", "202", "RT3", "out_of_order", "b1"),
            room("b1-203", "203", "RT3", "vacant_clean", "b1"),
            room("b2-101", "101", "RT1", "vacant_clean", "b2"),
            room("b2-102", "102", "RT2", "vacant_dirty", "b2"),
        ],
    )?;
    insert_all(
        tx,
        EMPLOYEE,
        vec![
            json!({"id": "E001", "name": "王经理", "role": "manager", "phone": "13900000001", BRANCH_COLUMN: "hq"}),
            json!({"id": "E002", "name": "刘前台", "role": "receptionist", "phone": "13900000002", BRANCH_COLUMN: "b1"}),
            json!({"id": "E003", "name": "赵阿姨", "role": "cleaner", "phone": "13900000003", BRANCH_COLUMN: "b1"}),
            json!({"id": "E004", "name": "钱师傅", "role": "cleaner", "phone": "13900000004", BRANCH_COLUMN: "b1"}),
        ],
    )?;
    insert_all(
        tx,
        GUEST,
        vec![
            json!({"id": "G001", "name": "张三", "phone": "13800000001", "id_number": "330102199001011234", BRANCH_COLUMN: "b1"}),
            json!({"id": "G002", "name": "李四", "phone": "13800000002", BRANCH_COLUMN: "b1"}),
        ],
    )?;

    // 张三 arrived yesterday for two nights; 200 of 576 paid.
    let arrived = today - Duration::days(1);
    let leaves = today + Duration::days(1);
    tx.insert(
        STAY,
        row(json!({
            "id": "S001",
            "guest_id": "G001",
            "guest_name": "张三",
            "room_id": "b1-102",
            "room_number": "102",
            "nightly_rate": 288.0,
            "check_in_time": format!("{arrived}T14:00:00+08:00"),
            "expected_check_out": leaves.to_string(),
            "status": "active",
            BRANCH_COLUMN: "b1",
        })),
    )?;
    tx.insert(
        BILL,
        row(json!({
            "id": "BL001",
            "stay_record_id": "S001",
            "room_number": "102",
            "total_amount": 576.0,
            "paid_amount": 200.0,
            "adjustment_amount": 0.0,
            "outstanding_amount": 376.0,
            "last_charged_date": today.to_string(),
            "status": "open",
            BRANCH_COLUMN: "b1",
        })),
    )?;
    tx.insert(
        PAYMENT,
        row(json!({
            "id": "P001",
            "bill_id": "BL001",
            "amount": 200.0,
            "method": "wechat",
            "received_by": "E002",
            "received_at": format!("{arrived}T14:05:00+08:00"),
            BRANCH_COLUMN: "b1",
        })),
    )?;

    tx.insert(
        RESERVATION,
        row(json!({
            "id": "RS001",
            "reservation_no": format!("R{}001", today.format("%Y%m%d")),
            "guest_id": "G002",
            "guest_name": "李四",
            "room_type_id": "RT2",
            "room_id": "b1-201",
            "check_in_date": today.to_string(),
            "check_out_date": (today + Duration::days(2)).to_string(),
            "status": "confirmed",
            BRANCH_COLUMN: "b1",
        })),
    )?;

    insert_all(
        tx,
        TASK,
        vec![
            json!({"id": "T001", "room_id": "b1-103", "room_number": "103", "task_type": "cleaning",
                   "status": "assigned", "assignee_id": "E003", BRANCH_COLUMN: "b1"}),
            json!({"id": "T002", "room_id": "b1-202", "room_number": "202", "task_type": "maintenance",
                   "status": "assigned", "assignee_id": "E004", BRANCH_COLUMN: "b1"}),
            json!({"id": "T003", "room_id": "b2-102", "room_number": "102", "task_type": "cleaning",
                   "status": "pending", BRANCH_COLUMN: "b2"}),
        ],
    )?;
    debug!(rooms, %today, "hotel demo data seeded");
    Ok(())
}
