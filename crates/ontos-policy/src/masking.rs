//! Output masking of sensitive values.
//!
//! Masking only changes the outward representation of a row; stored data is
//! never touched. Whether a field is shown plain, masked or hidden depends on
//! the viewer's clearance relative to the field's security level.

use ontos_protocol::{EntityMetadata, Row, SecurityLevel, SemanticType};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Plain,
    Masked,
    Hidden,
}

pub fn visibility(viewer: SecurityLevel, field: SecurityLevel) -> Visibility {
    if field <= SecurityLevel::Internal || viewer > field {
        Visibility::Plain
    } else if viewer == field {
        Visibility::Masked
    } else {
        Visibility::Hidden
    }
}

fn keep_ends(chars: &[char], head: usize, tail: usize) -> String {
    if chars.len() <= head + tail {
        return "*".repeat(chars.len());
    }
    let middle = chars.len() - head - tail;
    let mut out: String = chars[..head].iter().collect();
    out.push_str(&"*".repeat(middle));
    out.extend(&chars[chars.len() - tail..]);
    out
}

/// Deterministic redaction by semantic type.
pub fn mask_text(semantic: SemanticType, text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    match semantic {
        SemanticType::Phone => keep_ends(&chars, 3, 4),
        SemanticType::IdNumber => keep_ends(&chars, 4, 4),
        SemanticType::Email => match text.split_once('@') {
            Some((local, domain)) => {
                let first: String = local.chars().take(1).collect();
                format!("{first}***@{domain}")
            }
            None => keep_ends(&chars, 1, 0),
        },
        SemanticType::PersonName => match chars.split_first() {
            Some((first, rest)) => format!("{first}{}", "*".repeat(rest.len())),
            None => String::new(),
        },
        _ => keep_ends(&chars, 1, 1),
    }
}

pub fn mask_value(semantic: SemanticType, value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(mask_text(semantic, s)),
        other => Value::String(mask_text(semantic, &other.to_string())),
    }
}

/// Applies masking to every declared property of `row`.
pub fn mask_row(viewer: SecurityLevel, entity: &EntityMetadata, mut row: Row) -> Row {
    for property in &entity.properties {
        match visibility(viewer, property.security_level) {
            Visibility::Plain => {}
            Visibility::Masked => {
                if let Some(value) = row.get_mut(&property.name) {
                    *value = mask_value(property.semantic_type, value);
                }
            }
            Visibility::Hidden => {
                row.remove(&property.name);
            }
        }
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_protocol::{PropertyMetadata, PropertyType};
    use serde_json::json;

    #[test]
    fn visibility_follows_relative_level() {
        assert_eq!(visibility(SecurityLevel::Public, SecurityLevel::Internal), Visibility::Plain);
        assert_eq!(visibility(SecurityLevel::Confidential, SecurityLevel::Confidential), Visibility::Masked);
        assert_eq!(visibility(SecurityLevel::Restricted, SecurityLevel::Confidential), Visibility::Plain);
        assert_eq!(visibility(SecurityLevel::Internal, SecurityLevel::Restricted), Visibility::Hidden);
    }

    #[test]
    fn strategies_are_deterministic() {
        assert_eq!(mask_text(SemanticType::Phone, "13812345678"), "138****5678");
        assert_eq!(mask_text(SemanticType::IdNumber, "110101199001011234"), "1101**********1234");
        assert_eq!(mask_text(SemanticType::Email, "alice@example.com"), "a***@example.com");
        assert_eq!(mask_text(SemanticType::PersonName, "张三丰"), "张**");
        assert_eq!(mask_text(SemanticType::Phone, "123"), "***");
    }

    #[test]
    fn row_masking_hides_and_redacts() {
        let guest = EntityMetadata::new("Guest", "guests")
            .property(PropertyMetadata::new("name", PropertyType::String).semantic(SemanticType::PersonName))
            .property(
                PropertyMetadata::new("phone", PropertyType::String)
                    .semantic(SemanticType::Phone)
                    .security(SecurityLevel::Confidential),
            )
            .property(
                PropertyMetadata::new("id_number", PropertyType::String)
                    .semantic(SemanticType::IdNumber)
                    .security(SecurityLevel::Restricted),
            );
        let row = json!({"id": "G1", "name": "Alice", "phone": "13812345678", "id_number": "110101199001011234"})
            .as_object()
            .cloned()
            .unwrap_or_default();

        let masked = mask_row(SecurityLevel::Confidential, &guest, row);
        assert_eq!(masked["name"], "Alice");
        assert_eq!(masked["phone"], "138****5678");
        assert!(!masked.contains_key("id_number"));
    }
}
