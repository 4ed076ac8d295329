//! Hotel actions, grouped by desk.

mod billing;
mod front_desk;
mod housekeeping;
mod reservations;

use chrono::NaiveDate;
use ontos_actions::{ActionEnv, ActionRegistry};
use ontos_protocol::{FieldError, OntosError, OntosResult, ParamSpec, ParamType, Row, StoreTransaction};
use serde_json::Value;

/// A room handle as people say it: "301", "301房", "301号".
pub(crate) const ROOM_NUMBER_PATTERNS: [&str; 2] = [r"(\d{3,4})\s*(?:号房|号|房)", r"(?:^|\D)(\d{3,4})(?:\D|$)"];

pub(crate) const AMOUNT_PATTERNS: [&str; 2] = [
    r"(\d+(?:\.\d+)?)\s*(?:元|块|rmb|yuan)",
    r"(?i)(?:amount|金额|收款|付款|押金)\s*[:：]?\s*(\d+(?:\.\d+)?)",
];

pub(crate) const FRONT_DESK: [&str; 3] = ["receptionist", "manager", "admin"];
pub(crate) const MANAGEMENT: [&str; 2] = ["manager", "admin"];

pub fn register(actions: &mut ActionRegistry) -> OntosResult<()> {
    front_desk::register(actions)?;
    reservations::register(actions)?;
    billing::register(actions)?;
    housekeeping::register(actions)?;
    Ok(())
}

pub(crate) fn room_param(name: &str) -> ParamSpec {
    ParamSpec::new(name, ParamType::String)
        .required()
        .describe("房间 id 或房号")
        .refers_to(crate::ontology::ROOM, ["room_number"])
        .extract(ROOM_NUMBER_PATTERNS)
}

pub(crate) fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

pub(crate) fn str_field<'a>(row: &'a Row, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str)
}

pub(crate) fn money(row: &Row, field: &str) -> f64 {
    row.get(field).and_then(Value::as_f64).unwrap_or(0.0)
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// A money parameter, refused when it carries more than two decimals.
pub(crate) fn cents_param(env: &ActionEnv<'_>, name: &str) -> OntosResult<f64> {
    let value = env.f64_param(name)?;
    let cents = round_cents(value);
    if (value - cents).abs() > 1e-9 {
        return Err(OntosError::validation(
            env.action.name.clone(),
            vec![FieldError::new(name, "金额最多保留两位小数")],
        ));
    }
    Ok(cents)
}

pub(crate) fn outstanding(bill: &Row) -> f64 {
    round_cents(money(bill, "total_amount") + money(bill, "adjustment_amount") - money(bill, "paid_amount"))
}

pub(crate) fn date_field(row: &Row, field: &str) -> Option<NaiveDate> {
    str_field(row, field).and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

pub(crate) fn date_param(env: &ActionEnv<'_>, name: &str) -> Option<NaiveDate> {
    env.opt_str(name)
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
}

/// The single open bill of a stay.
pub(crate) fn bill_for_stay(tx: &dyn StoreTransaction, stay_id: &str) -> OntosResult<Row> {
    use ontos_protocol::RowFilter;
    tx.query(crate::ontology::BILL, &[RowFilter::eq("stay_record_id", stay_id)])?
        .into_iter()
        .next()
        .ok_or_else(|| OntosError::not_found(crate::ontology::BILL, format!("stay {stay_id}")))
}

pub(crate) fn require_id(row: &Row) -> OntosResult<String> {
    ontos_protocol::row_id(row)
        .map(str::to_owned)
        .ok_or_else(|| OntosError::Store("row without id".into()))
}
