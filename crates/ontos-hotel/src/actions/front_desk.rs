use chrono::{Days, Duration, NaiveDate};
use ontos_actions::{ActionEnv, ActionRegistry, FnAction};
use ontos_protocol::{
    ActionMetadata, ActionResult, FieldError, OntosError, OntosResult, ParamSpec, ParamType, RiskLevel, Row,
    RowFilter, StoreTransaction,
};
use serde_json::{Value, json};
use tracing::debug;

use super::{FRONT_DESK, ROOM_NUMBER_PATTERNS, bill_for_stay, date_field, money, require_id, room_param, round_cents, row, str_field};
use crate::events::{GUEST_CHECKED_IN, GUEST_CHECKED_OUT, ROOM_CHANGED, STAY_EXTENDED};
use crate::ontology::{BILL, BRANCH_COLUMN, GUEST, RESERVATION, ROOM, ROOM_TYPE, STAY};

pub(crate) const GUEST_NAME_PATTERNS: [&str; 2] = [
    r"(?:客人|住客|姓名|guest)\s*[:：]?\s*([\p{Han}]{2,4}?)(?:[，,。\s]|$|入住|开房|电话|手机|住)",
    r"(?i)guest\s+([A-Za-z]+(?:\s[A-Za-z]+)?)",
];
pub(crate) const PHONE_PATTERNS: [&str; 1] = [r"(?:^|\D)(1\d{10})(?:\D|$)"];
const NIGHTS_PATTERNS: [&str; 1] = [r"(?i)(\d+)\s*(?:晚|天|nights?)"];

fn stay_param() -> ParamSpec {
    ParamSpec::new("stay_id", ParamType::String)
        .required()
        .describe("住宿记录 id、房号或客人姓名")
        .refers_to(STAY, ["room_number", "guest_name"])
        .extract(ROOM_NUMBER_PATTERNS)
}

fn nights_param() -> ParamSpec {
    ParamSpec::new("nights", ParamType::Integer)
        .describe("入住晚数")
        .extract(NIGHTS_PATTERNS)
}

/// The date `nights` nights after `from`.
fn nights_after(action: &str, from: NaiveDate, nights: i64) -> OntosResult<NaiveDate> {
    u64::try_from(nights)
        .ok()
        .and_then(|n| from.checked_add_days(Days::new(n)))
        .ok_or_else(|| {
            OntosError::validation(action, vec![FieldError::new("nights", format!("{nights} nights is out of range"))])
        })
}

/// Room plus its type, the shape check-in constraints see as `before`.
fn room_context(tx: &dyn StoreTransaction, room_id: &str) -> OntosResult<Value> {
    let room = tx.require(ROOM, room_id)?;
    let room_type = match str_field(&room, "room_type_id") {
        Some(id) => tx.get(ROOM_TYPE, id)?,
        None => None,
    };
    Ok(json!({ "room": room, "room_type": room_type }))
}

fn nightly_rate(before: &Value) -> f64 {
    before["room_type"]["base_price"].as_f64().unwrap_or(0.0)
}

/// Finds the guest by phone (or by name when no phone is known) in the
/// branch, creating one when nobody matches.
pub(super) fn find_or_create_guest(
    tx: &mut dyn StoreTransaction,
    branch: &str,
    name: &str,
    phone: Option<&str>,
) -> OntosResult<String> {
    let mut filters = vec![RowFilter::eq(BRANCH_COLUMN, branch)];
    match phone {
        Some(phone) => filters.push(RowFilter::eq("phone", phone)),
        None => filters.push(RowFilter::eq("name", name)),
    }
    if let Some(existing) = tx.query(GUEST, &filters)?.first() {
        return require_id(existing);
    }
    let mut guest = row(json!({ "name": name, BRANCH_COLUMN: branch }));
    if let Some(phone) = phone {
        guest.insert("phone".into(), json!(phone));
    }
    tx.insert(GUEST, guest)
}

struct Opening<'a> {
    room: Row,
    guest_id: String,
    guest_name: &'a str,
    rate: f64,
    nights: i64,
    expected_check_out: NaiveDate,
    reservation_id: Option<&'a str>,
}

struct Opened {
    stay_id: String,
    bill_id: String,
    total: f64,
}

/// Creates the active stay and its open bill, charging every booked night,
/// and moves the room to occupied.
fn open_stay(env: &ActionEnv<'_>, tx: &mut dyn StoreTransaction, opening: Opening<'_>) -> OntosResult<Opened> {
    let room_id = require_id(&opening.room)?;
    let room_number = str_field(&opening.room, "room_number").unwrap_or_default().to_owned();
    let branch = str_field(&opening.room, BRANCH_COLUMN).unwrap_or_default().to_owned();

    let mut stay = row(json!({
        "guest_id": opening.guest_id,
        "guest_name": opening.guest_name,
        "room_id": room_id,
        "room_number": room_number,
        "nightly_rate": opening.rate,
        "check_in_time": env.now().to_rfc3339(),
        "expected_check_out": opening.expected_check_out.to_string(),
        "status": "active",
        BRANCH_COLUMN: branch,
    }));
    if let Some(reservation_id) = opening.reservation_id {
        stay.insert("reservation_id".into(), json!(reservation_id));
    }
    let stay_id = tx.insert(STAY, stay)?;
    env.transition(tx, ROOM, &room_id, "check_in")?;

    let total = round_cents(opening.rate * opening.nights as f64);
    let bill = row(json!({
        "stay_record_id": stay_id,
        "room_number": room_number,
        "total_amount": total,
        "paid_amount": 0.0,
        "adjustment_amount": 0.0,
        "outstanding_amount": total,
        "last_charged_date": (opening.expected_check_out - Duration::days(1)).to_string(),
        "status": "open",
        BRANCH_COLUMN: branch,
    }));
    let bill_id = tx.insert(BILL, bill)?;
    debug!(%stay_id, %bill_id, room = %room_number, total, "stay opened");
    Ok(Opened { stay_id, bill_id, total })
}

fn checked_in(room: &Row, guest_id: &str, guest_name: &str, opened: Opened) -> ActionResult {
    let room_number = str_field(room, "room_number").unwrap_or_default();
    ActionResult::ok(format!("{guest_name} 已入住 {room_number} 房，房费 {:.2} 元", opened.total))
        .with_entity(STAY, opened.stay_id.clone())
        .with_data("stay_id", json!(opened.stay_id))
        .with_data("bill_id", json!(opened.bill_id))
        .with_data("room_id", json!(str_field(room, "id")))
        .with_data("room_number", json!(room_number))
        .with_data("guest_id", json!(guest_id))
        .with_data("guest_name", json!(guest_name))
        .with_data("total_amount", json!(opened.total))
        .emit(GUEST_CHECKED_IN)
}

fn walkin_checkin(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("walkin_checkin", STAY)
        .describe("散客入住 办理入住 开房 walk-in check in")
        .keywords(["入住", "开房", "散客", "check in", "checkin"])
        .roles(FRONT_DESK)
        .undoable()
        .side_effects(["Room.status -> occupied", "creates Bill"])
        .param(room_param("room_id"))
        .param(
            ParamSpec::new("guest_name", ParamType::String)
                .required()
                .describe("客人姓名")
                .extract(GUEST_NAME_PATTERNS),
        )
        .param(
            ParamSpec::new("guest_phone", ParamType::String)
                .describe("客人手机号")
                .extract(PHONE_PATTERNS),
        )
        .param(nights_param().default_value(json!(1)));

    let handler = FnAction::new(|env, tx| {
        let room_id = env.str_param("room_id")?;
        let room = tx.require(ROOM, room_id)?;
        let branch = str_field(&room, BRANCH_COLUMN).unwrap_or_default().to_owned();
        let guest_name = env.str_param("guest_name")?;
        let guest_id = find_or_create_guest(tx, &branch, guest_name, env.opt_str("guest_phone"))?;
        let nights = env.opt_i64("nights").unwrap_or(1);
        let opening = Opening {
            room: room.clone(),
            guest_id: guest_id.clone(),
            guest_name,
            rate: nightly_rate(env.before),
            nights,
            expected_check_out: nights_after("walkin_checkin", env.now().date_naive(), nights)?,
            reservation_id: None,
        };
        let opened = open_stay(env, tx, opening)?;
        Ok(checked_in(&room, &guest_id, guest_name, opened))
    })
    .with_context(|env, tx| room_context(tx, env.str_param("room_id")?));

    actions.add(meta, handler)
}

fn checkin_reservation(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("checkin_reservation", STAY)
        .describe("预订入住 凭预订办理入住 reservation check in")
        .keywords(["预订入住", "预约入住", "reservation check in"])
        .roles(FRONT_DESK)
        .undoable()
        .side_effects(["Reservation.status -> checked_in", "Room.status -> occupied", "creates Bill"])
        .param(
            ParamSpec::new("reservation_id", ParamType::String)
                .required()
                .describe("预订 id、预订号或客人姓名")
                .refers_to(RESERVATION, ["reservation_no", "guest_name"])
                .extract([r"(?i)(R\d{11})"]),
        )
        .param(
            ParamSpec::new("room_id", ParamType::String)
                .describe("分配的房间；预订已指定房间时可省略")
                .refers_to(ROOM, ["room_number"])
                .extract(ROOM_NUMBER_PATTERNS),
        );

    let handler = FnAction::new(|env, tx| {
        let reservation = row(env.before["reservation"].clone());
        let room = row(env.before["room"].clone());
        let reservation_id = require_id(&reservation)?;
        let room_id = require_id(&room)?;
        let branch = str_field(&room, BRANCH_COLUMN).unwrap_or_default().to_owned();

        let guest_name = str_field(&reservation, "guest_name").unwrap_or("客人").to_owned();
        let guest_id = match str_field(&reservation, "guest_id") {
            Some(id) => id.to_owned(),
            None => find_or_create_guest(tx, &branch, &guest_name, None)?,
        };
        let today = env.now().date_naive();
        let check_out = date_field(&reservation, "check_out_date").unwrap_or(today + Duration::days(1));
        let check_in = date_field(&reservation, "check_in_date").unwrap_or(today);
        let nights = (check_out - check_in).num_days().max(1);

        env.transition(tx, RESERVATION, &reservation_id, "check_in")?;
        tx.update(RESERVATION, &reservation_id, row(json!({ "room_id": room_id })))?;

        let opening = Opening {
            room: room.clone(),
            guest_id: guest_id.clone(),
            guest_name: &guest_name,
            rate: nightly_rate(env.before),
            nights,
            expected_check_out: check_out.max(today + Duration::days(1)),
            reservation_id: Some(&reservation_id),
        };
        let opened = open_stay(env, tx, opening)?;
        Ok(checked_in(&room, &guest_id, &guest_name, opened).with_data("reservation_id", json!(reservation_id)))
    })
    .with_context(|env, tx| {
        let reservation_id = env.str_param("reservation_id")?;
        let reservation = tx.require(RESERVATION, reservation_id)?;
        let room_id = env
            .opt_str("room_id")
            .or_else(|| str_field(&reservation, "room_id"))
            .map(str::to_owned)
            .ok_or_else(|| {
                OntosError::validation(
                    env.action.name.clone(),
                    vec![FieldError::new("room_id", "is required when the reservation has no room")],
                )
            })?;
        let mut context = room_context(tx, &room_id)?;
        context["reservation"] = Value::Object(reservation);
        Ok(context)
    });

    actions.add(meta, handler)
}

/// Stay plus its bill, with the bill's outstanding balance computed.
fn stay_context(tx: &dyn StoreTransaction, stay_id: &str) -> OntosResult<Value> {
    let stay = tx.require(STAY, stay_id)?;
    let mut bill = bill_for_stay(tx, stay_id)?;
    bill.insert("outstanding_amount".into(), json!(super::outstanding(&bill)));
    Ok(json!({ "stay": stay, "bill": bill }))
}

fn checkout(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("checkout", STAY)
        .describe("退房 结账离店 check out")
        .keywords(["退房", "离店", "check out", "checkout"])
        .roles(FRONT_DESK)
        .undoable()
        .side_effects(["Room.status -> vacant_dirty", "Bill.status -> settled"])
        .param(stay_param());

    let handler = FnAction::new(|env, tx| {
        let stay_id = env.str_param("stay_id")?;
        let stay = row(env.before["stay"].clone());
        let bill = row(env.before["bill"].clone());
        let bill_id = require_id(&bill)?;
        let room_id = str_field(&stay, "room_id").unwrap_or_default().to_owned();
        let room_number = str_field(&stay, "room_number").unwrap_or_default().to_owned();

        env.transition(tx, STAY, stay_id, "check_out")?;
        tx.update(STAY, stay_id, row(json!({ "check_out_time": env.now().to_rfc3339() })))?;
        env.transition(tx, BILL, &bill_id, "settle")?;
        env.transition(tx, ROOM, &room_id, "check_out")?;

        if let Some(reservation_id) = str_field(&stay, "reservation_id")
            && tx
                .get(RESERVATION, reservation_id)?
                .is_some_and(|r| str_field(&r, "status") == Some("checked_in"))
        {
            env.transition(tx, RESERVATION, reservation_id, "complete")?;
        }

        Ok(ActionResult::ok(format!("{room_number} 房已退房"))
            .with_entity(STAY, stay_id)
            .with_data("stay_id", json!(stay_id))
            .with_data("bill_id", json!(bill_id))
            .with_data("room_id", json!(room_id))
            .with_data("room_number", json!(room_number))
            .with_data("total_amount", json!(money(&bill, "total_amount")))
            .emit(GUEST_CHECKED_OUT))
    })
    .with_context(|env, tx| stay_context(tx, env.str_param("stay_id")?));

    actions.add(meta, handler)
}

fn change_room(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("change_room", STAY)
        .describe("换房 更换房间 change room")
        .keywords(["换房", "换到", "change room", "move room"])
        .roles(FRONT_DESK)
        .undoable()
        .risk(RiskLevel::Medium)
        .side_effects(["old Room.status -> vacant_dirty", "new Room.status -> occupied"])
        .param(
            ParamSpec::new("stay_id", ParamType::String)
                .required()
                .describe("住宿记录 id、当前房号或客人姓名")
                .refers_to(STAY, ["room_number", "guest_name"])
                .extract([r"(\d{3,4})\s*(?:号房|号|房)?\s*换"]),
        )
        .param(
            room_param("new_room_id")
                .describe("目标房间")
                .extract([r"换(?:到|至|成)?\s*(\d{3,4})"]),
        );

    let handler = FnAction::new(|env, tx| {
        let stay_id = env.str_param("stay_id")?;
        let new_room_id = env.str_param("new_room_id")?;
        let stay = row(env.before["stay"].clone());
        let new_room = row(env.before["new_room"].clone());
        let old_room_id = str_field(&stay, "room_id").unwrap_or_default().to_owned();
        let old_number = str_field(&stay, "room_number").unwrap_or_default().to_owned();
        let new_number = str_field(&new_room, "room_number").unwrap_or_default().to_owned();

        env.transition(tx, ROOM, &old_room_id, "check_out")?;
        env.transition(tx, ROOM, new_room_id, "check_in")?;
        tx.update(
            STAY,
            stay_id,
            row(json!({ "room_id": new_room_id, "room_number": new_number })),
        )?;
        let bill_id = require_id(&bill_for_stay(tx, stay_id)?)?;
        tx.update(BILL, &bill_id, row(json!({ "room_number": new_number })))?;

        Ok(ActionResult::ok(format!("已从 {old_number} 换到 {new_number} 房"))
            .with_entity(STAY, stay_id)
            .with_data("stay_id", json!(stay_id))
            .with_data("old_room_id", json!(old_room_id))
            .with_data("old_room_number", json!(old_number))
            .with_data("room_id", json!(new_room_id))
            .with_data("room_number", json!(new_number))
            .emit(ROOM_CHANGED))
    })
    .with_context(|env, tx| {
        let stay = tx.require(STAY, env.str_param("stay_id")?)?;
        let new_room = tx.require(ROOM, env.str_param("new_room_id")?)?;
        Ok(json!({ "stay": stay, "new_room": new_room }))
    });

    actions.add(meta, handler)
}

fn extend_stay(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("extend_stay", STAY)
        .describe("续住 延住 extend stay")
        .keywords(["续住", "延住", "多住", "extend"])
        .roles(FRONT_DESK)
        .undoable()
        .side_effects(["Bill.total_amount += nightly_rate * nights"])
        .param(stay_param())
        .param(nights_param().required());

    let handler = FnAction::new(|env, tx| {
        let stay_id = env.str_param("stay_id")?;
        let nights = env.opt_i64("nights").unwrap_or(1);
        let stay = row(env.before["stay"].clone());
        let bill = row(env.before["bill"].clone());
        let bill_id = require_id(&bill)?;

        let today = env.now().date_naive();
        let expected = nights_after("extend_stay", date_field(&stay, "expected_check_out").unwrap_or(today), nights)?;
        let charge = round_cents(money(&stay, "nightly_rate") * nights as f64);
        let total = round_cents(money(&bill, "total_amount") + charge);

        tx.update(STAY, stay_id, row(json!({ "expected_check_out": expected.to_string() })))?;
        let mut patch = row(json!({
            "total_amount": total,
            "last_charged_date": (expected - Duration::days(1)).to_string(),
        }));
        let mut merged = bill.clone();
        merged.extend(patch.clone());
        patch.insert("outstanding_amount".into(), json!(super::outstanding(&merged)));
        tx.update(BILL, &bill_id, patch)?;

        let room_number = str_field(&stay, "room_number").unwrap_or_default();
        Ok(ActionResult::ok(format!("{room_number} 房续住 {nights} 晚，至 {expected}，加收 {charge:.2} 元"))
            .with_entity(STAY, stay_id)
            .with_data("stay_id", json!(stay_id))
            .with_data("bill_id", json!(bill_id))
            .with_data("room_number", json!(room_number))
            .with_data("expected_check_out", json!(expected.to_string()))
            .with_data("charge", json!(charge))
            .emit(STAY_EXTENDED))
    })
    .with_context(|env, tx| stay_context(tx, env.str_param("stay_id")?));

    actions.add(meta, handler)
}

pub(super) fn register(actions: &mut ActionRegistry) -> OntosResult<()> {
    walkin_checkin(actions)?;
    checkin_reservation(actions)?;
    checkout(actions)?;
    change_room(actions)?;
    extend_stay(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nights_after_rejects_out_of_range_counts() -> anyhow::Result<()> {
        let from = NaiveDate::from_ymd_opt(2026, 3, 30).unwrap_or_default();
        assert_eq!(nights_after("walkin_checkin", from, 3)?.to_string(), "2026-04-02");
        let err = nights_after("walkin_checkin", from, 1_000_000_000).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(nights_after("extend_stay", from, -1).is_err());
        Ok(())
    }
}
