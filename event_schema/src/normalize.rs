//! Payload normalization and validation.

use crate::{column_type, ColumnType, COLUMNS, JSON_COLUMNS, REQUIRED_COLUMNS};
use data_types::{EventType, FieldError, Severity, WideEvent};
use serde_json::{Map, Value};

/// Validates a raw payload against the schema.
///
/// Returns the complete list of problems; an empty list means the payload is
/// acceptable to [`normalize`].
pub fn validate(input: &Map<String, Value>) -> Vec<FieldError> {
    let mut errors = vec![];

    for field in REQUIRED_COLUMNS {
        let missing = match input.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            errors.push(FieldError::missing(*field));
        }
    }

    if let Some(Value::String(s)) = input.get("event_type") {
        if !s.is_empty() && s.parse::<EventType>().is_err() {
            errors.push(FieldError::invalid_enum("event_type", s));
        }
    }
    if let Some(Value::String(s)) = input.get("severity") {
        if !s.is_empty() && s.parse::<Severity>().is_err() {
            errors.push(FieldError::invalid_enum("severity", s));
        }
    }
    if let Some(v) = input.get("timestamp") {
        if !v.is_null() && v.as_i64().is_none() {
            errors.push(FieldError::invalid_type("timestamp", "an integer"));
        }
    }

    for key in input.keys() {
        if column_type(key).is_none() {
            errors.push(FieldError::unknown(key));
        }
    }

    errors
}

/// Builds a [`WideEvent`] from a raw payload, filling every schema column.
///
/// Missing columns become `None`; structured values in the JSON-carrying
/// columns are encoded to strings; everything else is coerced to its column
/// type where the coercion is lossless, and dropped otherwise. Callers are
/// expected to run [`validate`] first.
pub fn normalize(input: &Map<String, Value>) -> WideEvent {
    let mut event = WideEvent {
        event_id: string_value(input.get("event_id")).unwrap_or_default(),
        timestamp: input
            .get("timestamp")
            .and_then(Value::as_i64)
            .unwrap_or_default(),
        project_id: string_value(input.get("project_id")).unwrap_or_default(),
        event_type: input
            .get("event_type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default(),
        ..Default::default()
    };

    for (name, column) in COLUMNS {
        let value = match input.get(*name) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };
        match *name {
            // identity fields were handled above
            "event_id" | "timestamp" | "project_id" | "event_type" => {}
            "severity" => {
                event.severity = value.as_str().and_then(|s| s.parse().ok());
            }
            _ if JSON_COLUMNS.contains(name) => {
                set_string(&mut event, name, json_string(value));
            }
            _ => match column {
                ColumnType::Utf8 => {
                    if let Some(s) = string_value(Some(value)) {
                        set_string(&mut event, name, s);
                    }
                }
                ColumnType::Int64 => {
                    if let Some(i) = value.as_i64() {
                        set_int(&mut event, name, i);
                    }
                }
                ColumnType::Float64 => {
                    if let Some(f) = value.as_f64() {
                        set_float(&mut event, name, f);
                    }
                }
            },
        }
    }

    event
}

/// String rendering used for UTF-8 columns: strings pass through, scalars are
/// rendered, structured values are rejected.
fn string_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// JSON-carrying columns accept either a pre-encoded string or a structured
/// value, which is encoded compactly.
fn json_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Assign a UTF-8 column by name.
pub(crate) fn set_string(event: &mut WideEvent, name: &str, value: String) {
    let slot = match name {
        "event_id" => {
            event.event_id = value;
            return;
        }
        "project_id" => {
            event.project_id = value;
            return;
        }
        "event_type" => {
            if let Ok(t) = value.parse() {
                event.event_type = t;
            }
            return;
        }
        "severity" => {
            event.severity = value.parse().ok();
            return;
        }
        "organization_id" => &mut event.organization_id,
        "fingerprint" => &mut event.fingerprint,
        "message" => &mut event.message,
        "exception_type" => &mut event.exception_type,
        "stack_trace" => &mut event.stack_trace,
        "app_version" => &mut event.app_version,
        "app_build" => &mut event.app_build,
        "bundle_id" => &mut event.bundle_id,
        "environment" => &mut event.environment,
        "device_model" => &mut event.device_model,
        "device_id" => &mut event.device_id,
        "os_name" => &mut event.os_name,
        "os_version" => &mut event.os_version,
        "locale" => &mut event.locale,
        "timezone" => &mut event.timezone,
        "trace_id" => &mut event.trace_id,
        "span_id" => &mut event.span_id,
        "parent_span_id" => &mut event.parent_span_id,
        "operation" => &mut event.operation,
        "span_status" => &mut event.span_status,
        "metric_name" => &mut event.metric_name,
        "metric_unit" => &mut event.metric_unit,
        "user_id" => &mut event.user_id,
        "session_id" => &mut event.session_id,
        "tags" => &mut event.tags,
        "context" => &mut event.context,
        "breadcrumbs" => &mut event.breadcrumbs,
        _ => return,
    };
    *slot = Some(value);
}

/// Assign an int64 column by name.
pub(crate) fn set_int(event: &mut WideEvent, name: &str, value: i64) {
    match name {
        "timestamp" => event.timestamp = value,
        "memory_used" => event.memory_used = Some(value),
        "memory_total" => event.memory_total = Some(value),
        "disk_free" => event.disk_free = Some(value),
        _ => {}
    }
}

/// Assign a float64 column by name.
pub(crate) fn set_float(event: &mut WideEvent, name: &str, value: f64) {
    match name {
        "battery_level" => event.battery_level = Some(value),
        "duration_ms" => event.duration_ms = Some(value),
        "metric_value" => event.metric_value = Some(value),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::FieldErrorKind;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let input = payload(json!({"message": "boom"}));
        let errors = validate(&input);
        let missing: Vec<_> = errors
            .iter()
            .filter(|e| e.kind == FieldErrorKind::MissingRequiredField)
            .map(|e| e.field.as_str())
            .collect();
        assert_eq!(missing, vec!["event_id", "timestamp", "project_id", "event_type"]);
    }

    #[test]
    fn empty_string_counts_as_missing() {
        let input = payload(json!({
            "event_id": "",
            "timestamp": 1,
            "project_id": "p",
            "event_type": "error",
        }));
        let errors = validate(&input);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "event_id");
    }

    #[test]
    fn enum_domains_are_enforced() {
        let input = payload(json!({
            "event_id": "e",
            "timestamp": 1,
            "project_id": "p",
            "event_type": "gauge",
            "severity": "loud",
        }));
        let errors = validate(&input);
        assert_eq!(errors.len(), 2);
        assert_matches!(errors[0].kind, FieldErrorKind::InvalidEnum);
        assert_matches!(errors[1].kind, FieldErrorKind::InvalidEnum);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let input = payload(json!({
            "event_id": "e",
            "timestamp": 1,
            "project_id": "p",
            "event_type": "log",
            "favourite_color": "green",
        }));
        let errors = validate(&input);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "favourite_color");
        assert_matches!(errors[0].kind, FieldErrorKind::UnknownField);
    }

    #[test]
    fn normalize_fills_and_encodes() {
        let input = payload(json!({
            "event_id": "e1",
            "timestamp": 1_700_000_000_000i64,
            "project_id": "p1",
            "event_type": "error",
            "severity": "error",
            "message": "boom",
            "tags": {"region": "eu"},
            "breadcrumbs": ["a", "b"],
            "stack_trace": "[\"frame\"]",
            "memory_used": 1024,
            "battery_level": 0.75,
        }));
        assert!(validate(&input).is_empty());

        let event = normalize(&input);
        assert_eq!(event.event_id, "e1");
        assert_eq!(event.event_type, data_types::EventType::Error);
        assert_eq!(event.severity, Some(data_types::Severity::Error));
        assert_eq!(event.tags.as_deref(), Some(r#"{"region":"eu"}"#));
        assert_eq!(event.breadcrumbs.as_deref(), Some(r#"["a","b"]"#));
        // already-encoded JSON passes through untouched
        assert_eq!(event.stack_trace.as_deref(), Some("[\"frame\"]"));
        assert_eq!(event.memory_used, Some(1024));
        assert_eq!(event.battery_level, Some(0.75));
        // untouched columns stay null
        assert_eq!(event.device_model, None);
        assert_eq!(event.metric_value, None);
    }
}
