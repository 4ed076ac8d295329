use ontos_actions::{ActionRegistry, FnAction};
use ontos_protocol::{
    ActionMetadata, ActionResult, FieldError, OntosError, OntosResult, ParamSpec, ParamType, RiskLevel,
    StoreTransaction,
};
use serde_json::{Value, json};

use super::front_desk::{GUEST_NAME_PATTERNS, PHONE_PATTERNS, find_or_create_guest};
use super::{FRONT_DESK, ROOM_NUMBER_PATTERNS, date_field, row, str_field};
use crate::events::{RESERVATION_CANCELLED, RESERVATION_CREATED};
use crate::ontology::{BRANCH_COLUMN, RESERVATION, ROOM, ROOM_TYPE};

const DATE_PATTERNS: [&str; 1] = [r"(\d{4}-\d{2}-\d{2})"];

fn reservation_param() -> ParamSpec {
    ParamSpec::new("reservation_id", ParamType::String)
        .required()
        .describe("预订 id、预订号或客人姓名")
        .refers_to(RESERVATION, ["reservation_no", "guest_name"])
        .extract([r"(?i)(R\d{11})"])
}

/// `R` + business date + a three digit sequence, unique per day.
fn next_reservation_no(tx: &dyn StoreTransaction, day: &str) -> OntosResult<String> {
    let prefix = format!("R{}", day.replace('-', ""));
    let taken = tx
        .query(RESERVATION, &[])?
        .iter()
        .filter(|r| str_field(r, "reservation_no").is_some_and(|n| n.starts_with(&prefix)))
        .count();
    Ok(format!("{prefix}{:03}", taken + 1))
}

fn create_reservation(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("create_reservation", RESERVATION)
        .describe("新建预订 订房 预约房间 create reservation booking")
        .keywords(["预订", "订房", "预约", "book", "reservation"])
        .roles(FRONT_DESK)
        .undoable()
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
        .param(
            ParamSpec::new("room_type_id", ParamType::String)
                .required()
                .describe("房型")
                .refers_to(ROOM_TYPE, ["name"])
                .extract([r"(大床房|双床房|套房)"]),
        )
        .param(
            ParamSpec::new("room_id", ParamType::String)
                .describe("指定房间")
                .refers_to(ROOM, ["room_number"])
                .extract(ROOM_NUMBER_PATTERNS),
        )
        .param(
            ParamSpec::new("check_in_date", ParamType::Date)
                .required()
                .describe("入住日期 YYYY-MM-DD")
                .extract(DATE_PATTERNS),
        )
        .param(
            ParamSpec::new("check_out_date", ParamType::Date)
                .required()
                .describe("离店日期 YYYY-MM-DD")
                .extract([r"\d{4}-\d{2}-\d{2}\D+(\d{4}-\d{2}-\d{2})"]),
        )
        .param(ParamSpec::new("branch_id", ParamType::String).describe("门店，默认操作人所在门店"))
        .param(
            ParamSpec::new("confirm", ParamType::Boolean)
                .describe("创建后直接确认")
                .default_value(json!(true)),
        );

    let handler = FnAction::new(|env, tx| {
        let branch = env
            .opt_str("branch_id")
            .or(env.user().scope_id.as_deref())
            .ok_or_else(|| {
                OntosError::validation(
                    env.action.name.clone(),
                    vec![FieldError::new("branch_id", "is required for users without a branch")],
                )
            })?
            .to_owned();
        let guest_name = env.str_param("guest_name")?;
        let phone = env.opt_str("guest_phone");

        let guest_id = find_or_create_guest(tx, &branch, guest_name, phone)?;

        let check_in = env.str_param("check_in_date")?;
        let reservation_no = next_reservation_no(tx, &env.now().date_naive().to_string())?;
        let mut reservation = row(json!({
            "reservation_no": reservation_no,
            "guest_id": guest_id,
            "guest_name": guest_name,
            "room_type_id": env.str_param("room_type_id")?,
            "check_in_date": check_in,
            "check_out_date": env.str_param("check_out_date")?,
            "status": "pending",
            BRANCH_COLUMN: branch,
        }));
        if let Some(room_id) = env.opt_str("room_id") {
            reservation.insert("room_id".into(), json!(room_id));
        }
        let reservation_id = tx.insert(RESERVATION, reservation)?;
        let confirmed = env.params.get("confirm").and_then(Value::as_bool).unwrap_or(true);
        if confirmed {
            env.transition(tx, RESERVATION, &reservation_id, "confirm")?;
        }

        Ok(ActionResult::ok(format!("已为 {guest_name} 预订，预订号 {reservation_no}，{check_in} 入住"))
            .with_entity(RESERVATION, reservation_id.clone())
            .with_data("reservation_id", json!(reservation_id))
            .with_data("reservation_no", json!(reservation_no))
            .with_data("guest_id", json!(guest_id))
            .with_data("status", json!(if confirmed { "confirmed" } else { "pending" }))
            .emit(RESERVATION_CREATED))
    });

    actions.add(meta, handler)
}

fn cancel_reservation(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("cancel_reservation", RESERVATION)
        .describe("取消预订 退订 cancel reservation")
        .keywords(["取消预订", "退订", "取消", "cancel"])
        .roles(FRONT_DESK)
        .confirm()
        .risk(RiskLevel::Medium)
        .undoable()
        .param(reservation_param())
        .param(ParamSpec::new("reason", ParamType::String).describe("取消原因"));

    let handler = FnAction::new(|env, tx| {
        let reservation_id = env.str_param("reservation_id")?;
        let reservation = tx.require(RESERVATION, reservation_id)?;
        env.transition(tx, RESERVATION, reservation_id, "cancel")?;
        if let Some(reason) = env.opt_str("reason") {
            tx.update(RESERVATION, reservation_id, row(json!({ "cancel_reason": reason })))?;
        }
        let number = str_field(&reservation, "reservation_no").unwrap_or(reservation_id);
        Ok(ActionResult::ok(format!("预订 {number} 已取消"))
            .with_entity(RESERVATION, reservation_id)
            .with_data("reservation_no", json!(number))
            .emit(RESERVATION_CANCELLED))
    });

    actions.add(meta, handler)
}

fn mark_no_show(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("mark_no_show", RESERVATION)
        .describe("标记未到店 no show")
        .keywords(["未到店", "没来", "no show", "noshow"])
        .roles(FRONT_DESK)
        .undoable()
        .param(reservation_param());

    let handler = FnAction::new(|env, tx| {
        let reservation_id = env.str_param("reservation_id")?;
        env.transition(tx, RESERVATION, reservation_id, "mark_no_show")?;
        let number = env.before["reservation"]["reservation_no"].as_str().unwrap_or(reservation_id);
        Ok(ActionResult::ok(format!("预订 {number} 已标记为未到店"))
            .with_entity(RESERVATION, reservation_id)
            .with_data("reservation_no", json!(number)))
    })
    .with_context(|env, tx| {
        let reservation = tx.require(RESERVATION, env.str_param("reservation_id")?)?;
        let due = date_field(&reservation, "check_in_date");
        let overdue = due.is_some_and(|d| d < env.now().date_naive());
        Ok(json!({ "reservation": reservation, "overdue": overdue }))
    });

    actions.add(meta, handler)
}

pub(super) fn register(actions: &mut ActionRegistry) -> OntosResult<()> {
    create_reservation(actions)?;
    cancel_reservation(actions)?;
    mark_no_show(actions)
}
