//! Row-level filter evaluation.
//!
//! A filter on an absent attribute yields `false`, except `neq` which yields
//! `true`. `eq`/`neq`/`in` compare via string coercion, `contains` and
//! `starts_with` are case-insensitive and string-only, the ordering operators
//! need numbers on both sides.

use data_types::{EventFilter, FieldValue, FilterOp, WideEvent};
use serde_json::Value;
use std::collections::HashSet;

/// Whether an event satisfies every filter of a conjunction.
pub fn matches_all(event: &WideEvent, filters: &[EventFilter]) -> bool {
    filters.iter().all(|filter| matches(event, filter))
}

/// Whether an event satisfies one filter.
pub fn matches(event: &WideEvent, filter: &EventFilter) -> bool {
    let field = event.field(&filter.attribute);
    match (filter.op, field) {
        (FilterOp::Neq, None) => true,
        (_, None) => false,
        (FilterOp::Eq, Some(field)) => coerced_eq(&field, &filter.value),
        (FilterOp::Neq, Some(field)) => !coerced_eq(&field, &filter.value),
        (FilterOp::Contains, Some(FieldValue::Str(s))) => match filter.value.as_str() {
            Some(needle) => s.to_lowercase().contains(&needle.to_lowercase()),
            None => false,
        },
        (FilterOp::StartsWith, Some(FieldValue::Str(s))) => match filter.value.as_str() {
            Some(prefix) => s.to_lowercase().starts_with(&prefix.to_lowercase()),
            None => false,
        },
        (FilterOp::Contains | FilterOp::StartsWith, Some(_)) => false,
        (FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte, Some(field)) => {
            let (Some(lhs), Some(rhs)) = (field.as_f64(), filter.value.as_f64()) else {
                return false;
            };
            match filter.op {
                FilterOp::Gt => lhs > rhs,
                FilterOp::Gte => lhs >= rhs,
                FilterOp::Lt => lhs < rhs,
                _ => lhs <= rhs,
            }
        }
        (FilterOp::In, Some(field)) => match &filter.value {
            Value::Array(candidates) => candidates.iter().any(|c| coerced_eq(&field, c)),
            _ => false,
        },
    }
}

/// String-coerced equality between an attribute and a JSON comparand.
fn coerced_eq(field: &FieldValue<'_>, value: &Value) -> bool {
    match value {
        Value::String(s) => field.render() == *s,
        Value::Number(_) | Value::Bool(_) => field.render() == scalar_string(value),
        _ => false,
    }
}

/// Scalar JSON rendered the way attribute values render.
fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Values actively selected for an attribute by the `eq`/`in` filters of a
/// request. Used to mark facet values as `selected`.
pub fn selected_values(filters: &[EventFilter], attribute: &str) -> HashSet<String> {
    let mut selected = HashSet::new();
    for filter in filters.iter().filter(|f| f.attribute == attribute) {
        match (filter.op, &filter.value) {
            (FilterOp::Eq, value) => {
                selected.insert(scalar_string(value));
            }
            (FilterOp::In, Value::Array(values)) => {
                selected.extend(values.iter().map(scalar_string));
            }
            _ => {}
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::EventType;
    use serde_json::json;

    fn event() -> WideEvent {
        WideEvent {
            event_id: "e1".into(),
            timestamp: 1_700_000_000_000,
            project_id: "p1".into(),
            event_type: EventType::Error,
            message: Some("Connection Timeout".into()),
            duration_ms: Some(250.5),
            memory_used: Some(1024),
            ..Default::default()
        }
    }

    fn filter(attribute: &str, op: FilterOp, value: Value) -> EventFilter {
        EventFilter {
            attribute: attribute.into(),
            op,
            value,
        }
    }

    #[test]
    fn eq_uses_string_coercion() {
        assert!(matches(&event(), &filter("event_type", FilterOp::Eq, json!("error"))));
        assert!(matches(&event(), &filter("memory_used", FilterOp::Eq, json!(1024))));
        assert!(matches(&event(), &filter("memory_used", FilterOp::Eq, json!("1024"))));
        assert!(!matches(&event(), &filter("memory_used", FilterOp::Eq, json!(1025))));
    }

    #[test]
    fn absent_attribute_semantics() {
        // absent attribute: false for everything except neq
        assert!(!matches(&event(), &filter("os_name", FilterOp::Eq, json!("ios"))));
        assert!(!matches(&event(), &filter("os_name", FilterOp::Contains, json!("i"))));
        assert!(!matches(&event(), &filter("os_name", FilterOp::Gt, json!(1))));
        assert!(matches(&event(), &filter("os_name", FilterOp::Neq, json!("ios"))));
        // unknown attribute behaves the same way
        assert!(matches(&event(), &filter("not_a_column", FilterOp::Neq, json!("x"))));
        assert!(!matches(&event(), &filter("not_a_column", FilterOp::Eq, json!("x"))));
    }

    #[test]
    fn substring_operators_are_case_insensitive_and_string_only() {
        assert!(matches(&event(), &filter("message", FilterOp::Contains, json!("TIMEOUT"))));
        assert!(matches(&event(), &filter("message", FilterOp::StartsWith, json!("conn"))));
        assert!(!matches(&event(), &filter("message", FilterOp::StartsWith, json!("timeout"))));
        // numeric attribute never matches a substring operator
        assert!(!matches(&event(), &filter("memory_used", FilterOp::Contains, json!("10"))));
        // non-string comparand never matches
        assert!(!matches(&event(), &filter("message", FilterOp::Contains, json!(5))));
    }

    #[test]
    fn ordering_operators_need_numbers() {
        assert!(matches(&event(), &filter("duration_ms", FilterOp::Gt, json!(250))));
        assert!(matches(&event(), &filter("duration_ms", FilterOp::Lte, json!(250.5))));
        assert!(!matches(&event(), &filter("duration_ms", FilterOp::Lt, json!(250.5))));
        assert!(matches(&event(), &filter("memory_used", FilterOp::Gte, json!(1024))));
        // non-numeric comparand
        assert!(!matches(&event(), &filter("memory_used", FilterOp::Gt, json!("lots"))));
        // non-numeric attribute
        assert!(!matches(&event(), &filter("message", FilterOp::Gt, json!(1))));
    }

    #[test]
    fn in_requires_a_list() {
        assert!(matches(
            &event(),
            &filter("event_type", FilterOp::In, json!(["log", "error"]))
        ));
        assert!(!matches(
            &event(),
            &filter("event_type", FilterOp::In, json!(["log", "span"]))
        ));
        assert!(!matches(&event(), &filter("event_type", FilterOp::In, json!("error"))));
        assert!(matches(
            &event(),
            &filter("memory_used", FilterOp::In, json!([512, 1024]))
        ));
    }

    #[test]
    fn conjunction_requires_every_filter() {
        let filters = vec![
            filter("event_type", FilterOp::Eq, json!("error")),
            filter("duration_ms", FilterOp::Gt, json!(100)),
        ];
        assert!(matches_all(&event(), &filters));

        let filters = vec![
            filter("event_type", FilterOp::Eq, json!("error")),
            filter("duration_ms", FilterOp::Gt, json!(1000)),
        ];
        assert!(!matches_all(&event(), &filters));
        assert!(matches_all(&event(), &[]));
    }

    #[test]
    fn selected_values_come_from_eq_and_in() {
        let filters = vec![
            filter("severity", FilterOp::Eq, json!("error")),
            filter("severity", FilterOp::In, json!(["fatal", "warning"])),
            filter("severity", FilterOp::Contains, json!("err")),
            filter("os_name", FilterOp::Eq, json!("ios")),
        ];
        let selected = selected_values(&filters, "severity");
        assert_eq!(selected.len(), 3);
        assert!(selected.contains("error"));
        assert!(selected.contains("fatal"));
        assert!(selected.contains("warning"));
        assert!(selected_values(&filters, "device_model").is_empty());
    }
}
