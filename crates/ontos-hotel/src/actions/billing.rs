use chrono::NaiveDate;
use ontos_actions::{ActionEnv, ActionRegistry, FnAction};
use ontos_protocol::{
    ActionMetadata, ActionResult, OntosResult, ParamSpec, ParamType, RiskLevel, Row, RowFilter, StoreTransaction,
};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{
    AMOUNT_PATTERNS, FRONT_DESK, cents_param, MANAGEMENT, ROOM_NUMBER_PATTERNS, bill_for_stay, date_field, date_param, money,
    outstanding, require_id, round_cents, row, str_field,
};
use crate::events::{BILL_ADJUSTED, PAYMENT_RECEIVED, ROOM_CHARGES_POSTED};
use crate::ontology::{BILL, BRANCH_COLUMN, PAYMENT, STAY};

pub(crate) const PAYMENT_METHODS: [&str; 4] = ["cash", "card", "wechat", "alipay"];

fn bill_param() -> ParamSpec {
    ParamSpec::new("bill_id", ParamType::String)
        .required()
        .describe("账单 id 或房号")
        .refers_to(BILL, ["room_number"])
        .extract(ROOM_NUMBER_PATTERNS)
}

fn bill_context(env: &ActionEnv<'_>, tx: &dyn StoreTransaction) -> OntosResult<Value> {
    let mut bill = tx.require(BILL, env.str_param("bill_id")?)?;
    bill.insert("outstanding_amount".into(), json!(outstanding(&bill)));
    Ok(json!({ "bill": bill }))
}

/// Writes `patch` into the bill and keeps the stored outstanding balance in
/// step with it.
fn patch_bill(tx: &mut dyn StoreTransaction, bill: &Row, mut patch: Row) -> OntosResult<f64> {
    let mut merged = bill.clone();
    merged.extend(patch.clone());
    let balance = outstanding(&merged);
    patch.insert("outstanding_amount".into(), json!(balance));
    tx.update(BILL, &require_id(bill)?, patch)?;
    Ok(balance)
}

fn add_payment(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("add_payment", BILL)
        .describe("收款 付款 交押金 账单收款 add payment deposit")
        .keywords(["收款", "付款", "押金", "交钱", "payment", "pay", "deposit"])
        .roles(FRONT_DESK)
        .undoable()
        .side_effects(["creates Payment", "Bill.paid_amount += amount"])
        .param(bill_param())
        .param(
            ParamSpec::new("amount", ParamType::Number)
                .required()
                .describe("金额（元）")
                .extract(AMOUNT_PATTERNS),
        )
        .param(
            ParamSpec::new("method", ParamType::String)
                .describe("支付方式")
                .one_of(PAYMENT_METHODS)
                .default_value(json!("cash")),
        );

    let handler = FnAction::new(|env, tx| {
        let amount = cents_param(env, "amount")?;
        let bill = row(env.before["bill"].clone());
        let bill_id = require_id(&bill)?;
        let method = env.opt_str("method").unwrap_or("cash");

        let payment_id = tx.insert(
            PAYMENT,
            row(json!({
                "bill_id": bill_id,
                "amount": amount,
                "method": method,
                "received_by": env.user().user_id,
                "received_at": env.now().to_rfc3339(),
                BRANCH_COLUMN: str_field(&bill, BRANCH_COLUMN),
            })),
        )?;
        let paid = round_cents(money(&bill, "paid_amount") + amount);
        let balance = patch_bill(tx, &bill, row(json!({ "paid_amount": paid })))?;

        let room_number = str_field(&bill, "room_number").unwrap_or_default();
        Ok(ActionResult::ok(format!("{room_number} 房收款 {amount:.2} 元，待付 {balance:.2} 元"))
            .with_entity(BILL, bill_id.clone())
            .with_data("payment_id", json!(payment_id))
            .with_data("bill_id", json!(bill_id))
            .with_data("room_number", json!(room_number))
            .with_data("outstanding_amount", json!(balance))
            .emit(PAYMENT_RECEIVED))
    })
    .with_context(bill_context);

    actions.add(meta, handler)
}

fn adjust_bill(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("adjust_bill", BILL)
        .describe("调整账单 减免 账单调账 adjust bill")
        .keywords(["调整账单", "调账", "减免", "adjust"])
        .roles(MANAGEMENT)
        .confirm()
        .risk(RiskLevel::High)
        .undoable()
        .side_effects(["Bill.adjustment_amount += amount"])
        .param(bill_param())
        .param(
            ParamSpec::new("amount", ParamType::Number)
                .required()
                .describe("调整金额，负数为减免")
                .extract([r"(?:调整|调账|adjust)\s*(-?\d+(?:\.\d+)?)"]),
        )
        .param(
            ParamSpec::new("reason", ParamType::String)
                .required()
                .describe("调整原因")
                .extract([r"(?:原因|因为|reason)\s*[:：]?\s*(.+)$"]),
        );

    let handler = FnAction::new(|env, tx| {
        let amount = cents_param(env, "amount")?;
        let bill = row(env.before["bill"].clone());
        let bill_id = require_id(&bill)?;
        let adjustment = round_cents(money(&bill, "adjustment_amount") + amount);
        let patch = row(json!({
            "adjustment_amount": adjustment,
            "adjustment_reason": env.str_param("reason")?,
        }));
        let balance = patch_bill(tx, &bill, patch)?;

        let room_number = str_field(&bill, "room_number").unwrap_or_default();
        Ok(ActionResult::ok(format!("{room_number} 房账单调整 {amount:.2} 元，待付 {balance:.2} 元"))
            .with_entity(BILL, bill_id.clone())
            .with_data("bill_id", json!(bill_id))
            .with_data("room_number", json!(room_number))
            .with_data("outstanding_amount", json!(balance))
            .emit(BILL_ADJUSTED))
    })
    .with_context(bill_context);

    actions.add(meta, handler)
}

/// Charges one night to every open bill whose stay is still active and has
/// not been charged for `business_date`.
fn post_charges(tx: &mut dyn StoreTransaction, business_date: NaiveDate, branch: Option<&str>) -> OntosResult<(usize, f64)> {
    let mut filters = vec![RowFilter::eq("status", "active")];
    if let Some(branch) = branch {
        filters.push(RowFilter::eq(BRANCH_COLUMN, branch));
    }
    let mut posted = 0;
    let mut total = 0.0;
    for stay in tx.query(STAY, &filters)? {
        let stay_id = require_id(&stay)?;
        let bill = bill_for_stay(tx, &stay_id)?;
        if str_field(&bill, "status") != Some("open") {
            continue;
        }
        if date_field(&bill, "last_charged_date").is_some_and(|last| last >= business_date) {
            continue;
        }
        let rate = money(&stay, "nightly_rate");
        let patch = row(json!({
            "total_amount": round_cents(money(&bill, "total_amount") + rate),
            "last_charged_date": business_date.to_string(),
        }));
        patch_bill(tx, &bill, patch)?;
        debug!(%stay_id, rate, %business_date, "night charged");
        posted += 1;
        total += rate;
    }
    Ok((posted, round_cents(total)))
}

fn post_room_charges(actions: &mut ActionRegistry) -> OntosResult<()> {
    let meta = ActionMetadata::new("post_room_charges", BILL)
        .describe("夜审 入账房费 post nightly room charges")
        .keywords(["夜审", "入账", "房费", "night audit"])
        .roles(MANAGEMENT)
        .side_effects(["Bill.total_amount += nightly_rate for overstaying guests"])
        .param(ParamSpec::new("business_date", ParamType::Date).describe("营业日，默认今天"))
        .param(ParamSpec::new("branch_id", ParamType::String).describe("只处理该门店"));

    let handler = FnAction::new(|env, tx| {
        let business_date = date_param(env, "business_date").unwrap_or_else(|| env.now().date_naive());
        let (posted, total) = post_charges(tx, business_date, env.opt_str("branch_id"))?;
        info!(%business_date, posted, total, "room charges posted");

        let mut result = ActionResult::ok(format!("{business_date} 夜审：{posted} 间在住房入账 {total:.2} 元"))
            .with_data("business_date", json!(business_date.to_string()))
            .with_data("posted", json!(posted))
            .with_data("total", json!(total));
        if posted > 0 {
            result = result.emit(ROOM_CHARGES_POSTED);
        }
        Ok(result)
    });

    actions.add(meta, handler)
}

pub(super) fn register(actions: &mut ActionRegistry) -> OntosResult<()> {
    add_payment(actions)?;
    adjust_bill(actions)?;
    post_room_charges(actions)
}
