//! Parameter schema validation.
//!
//! Every violated field is reported; validation never stops at the first
//! failure. Accepted values are normalised (numeric strings become numbers,
//! defaults are filled in) so handlers see typed parameters.

use chrono::NaiveDate;
use ontos_protocol::{ActionMetadata, FieldError, ParamSpec, ParamType};
use serde_json::{Map, Number, Value};

pub type Params = Map<String, Value>;

fn coerce(spec: &ParamSpec, value: &Value) -> Result<Value, String> {
    match (spec.param_type, value) {
        (ParamType::String, Value::String(_)) => Ok(value.clone()),
        (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ParamType::Integer, Value::Number(n)) if n.is_i64() => Ok(value.clone()),
        (ParamType::Integer, Value::Number(n)) if n.is_u64() => Err("is out of range".to_owned()),
        (ParamType::Integer, Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() != 0.0 => Err("must be an integer".to_owned()),
            // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
            Some(f) if f >= i64::MIN as f64 && f < i64::MAX as f64 => Ok(Value::from(f as i64)),
            _ => Err("is out of range".to_owned()),
        },
        (ParamType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| "must be an integer".to_owned()),
        (ParamType::Number, Value::Number(_)) => Ok(value.clone()),
        (ParamType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| "must be a number".to_owned()),
        (ParamType::Boolean, Value::Bool(_)) => Ok(value.clone()),
        (ParamType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err("must be a boolean".to_owned()),
        },
        (ParamType::Date, Value::String(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map(|d| Value::String(d.to_string()))
            .map_err(|_| "must be a date (YYYY-MM-DD)".to_owned()),
        (ParamType::Object, Value::Object(_)) | (ParamType::Array, Value::Array(_)) => Ok(value.clone()),
        (ty, _) => Err(format!("expected {}", type_name(ty))),
    }
}

fn type_name(ty: ParamType) -> &'static str {
    match ty {
        ParamType::String => "a string",
        ParamType::Integer => "an integer",
        ParamType::Number => "a number",
        ParamType::Boolean => "a boolean",
        ParamType::Date => "a date",
        ParamType::Object => "an object",
        ParamType::Array => "an array",
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Validates `raw` against the action's parameter schema. Parameters that
/// the schema does not declare are passed through unchanged.
pub fn validate_params(action: &ActionMetadata, raw: &Value) -> Result<Params, Vec<FieldError>> {
    let mut params = match raw {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(vec![FieldError::new("params", "must be an object")]),
    };

    let mut errors = Vec::new();
    for spec in &action.params {
        let provided = params.get(&spec.name).filter(|v| !is_blank(v)).cloned();
        let Some(value) = provided.or_else(|| spec.default.clone()) else {
            params.remove(&spec.name);
            if spec.required {
                errors.push(FieldError::new(&spec.name, "is required"));
            }
            continue;
        };
        match coerce(spec, &value) {
            Ok(value) => {
                if !spec.enum_values.is_empty()
                    && !value
                        .as_str()
                        .is_some_and(|s| spec.enum_values.iter().any(|e| e == s))
                {
                    errors.push(FieldError::new(
                        &spec.name,
                        format!("must be one of: {}", spec.enum_values.join(", ")),
                    ));
                } else {
                    params.insert(spec.name.clone(), value);
                }
            }
            Err(message) => errors.push(FieldError::new(&spec.name, message)),
        }
    }

    if errors.is_empty() { Ok(params) } else { Err(errors) }
}

/// Names of required parameters absent from `params`.
pub fn missing_required(action: &ActionMetadata, params: &Params) -> Vec<String> {
    action
        .params
        .iter()
        .filter(|p| p.required && p.default.is_none())
        .filter(|p| params.get(&p.name).is_none_or(is_blank))
        .map(|p| p.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment() -> ActionMetadata {
        ActionMetadata::new("add_payment", "Bill")
            .param(ParamSpec::new("bill_id", ParamType::String).required())
            .param(ParamSpec::new("amount", ParamType::Number).required())
            .param(
                ParamSpec::new("method", ParamType::String)
                    .one_of(["cash", "card", "wechat", "alipay"])
                    .default_value(json!("cash")),
            )
            .param(ParamSpec::new("nights", ParamType::Integer))
    }

    #[test]
    fn reports_every_failing_field() {
        let errors = validate_params(&payment(), &json!({"method": "cheque", "nights": "x"})).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["bill_id", "amount", "method", "nights"]);
    }

    #[test]
    fn out_of_range_integers_are_refused() {
        for nights in [json!(1e30), json!(u64::MAX), json!("99999999999999999999")] {
            let errors = validate_params(&payment(), &json!({"bill_id": "B1", "amount": 1, "nights": nights})).unwrap_err();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].field, "nights");
        }
        let params = validate_params(&payment(), &json!({"bill_id": "B1", "amount": 1, "nights": -3.0})).unwrap_or_default();
        assert_eq!(params["nights"], json!(-3));
    }

    #[test]
    fn coerces_and_fills_defaults() {
        let params = validate_params(&payment(), &json!({"bill_id": "B1", "amount": "150.5", "nights": 2.0, "note": "x"}))
            .unwrap_or_default();
        assert_eq!(params["amount"], json!(150.5));
        assert_eq!(params["method"], json!("cash"));
        assert_eq!(params["nights"], json!(2));
        assert_eq!(params["note"], json!("x"));
    }

    #[test]
    fn blank_strings_count_as_missing() {
        let errors = validate_params(&payment(), &json!({"bill_id": "  ", "amount": 1})).unwrap_err();
        assert_eq!(errors[0].field, "bill_id");
        let mut params = Params::new();
        params.insert("amount".into(), json!(3));
        assert_eq!(missing_required(&payment(), &params), vec!["bill_id"]);
    }

    #[test]
    fn non_object_params_are_rejected() {
        assert!(validate_params(&payment(), &json!([1, 2])).is_err());
        let date = ActionMetadata::new("extend_stay", "StayRecord")
            .param(ParamSpec::new("new_checkout_date", ParamType::Date).required());
        assert!(validate_params(&date, &json!({"new_checkout_date": "2026-02-30"})).is_err());
        assert!(validate_params(&date, &json!({"new_checkout_date": "2026-03-01"})).is_ok());
    }
}
