//! OTLP-shaped receivers.
//!
//! Accepts the JSON shape of OTLP export requests for traces, logs and
//! metrics and converts each span, log record and metric data point into one
//! wide-event payload, which then flows through the normal intake path.

use crate::ProjectAuth;
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Converts an OTLP trace export payload: one span → one event payload.
pub fn convert_traces(auth: &ProjectAuth, payload: &Value) -> Vec<Map<String, Value>> {
    let mut events = vec![];
    for resource in list(payload, "resourceSpans") {
        let service = resource_service_name(resource);
        for scope in list(resource, "scopeSpans") {
            for span in list(scope, "spans") {
                let start = nanos(span, "startTimeUnixNano");
                let end = nanos(span, "endTimeUnixNano");
                let mut event = base_event(auth, "span", start / 1_000_000);
                set_opt_str(&mut event, "bundle_id", service.clone());
                set_opt_str(&mut event, "trace_id", id_field(span, "traceId"));
                set_opt_str(&mut event, "span_id", id_field(span, "spanId"));
                set_opt_str(&mut event, "parent_span_id", id_field(span, "parentSpanId"));
                set_opt_str(
                    &mut event,
                    "operation",
                    span.get("name").and_then(Value::as_str).map(str::to_string),
                );
                if end >= start {
                    event.insert(
                        "duration_ms".to_string(),
                        json!((end - start) as f64 / 1e6),
                    );
                }
                event.insert(
                    "span_status".to_string(),
                    json!(span_status(span.get("status"))),
                );
                events.push(event);
            }
        }
    }
    events
}

/// Converts an OTLP logs export payload: one log record → one event payload.
pub fn convert_logs(auth: &ProjectAuth, payload: &Value) -> Vec<Map<String, Value>> {
    let mut events = vec![];
    for resource in list(payload, "resourceLogs") {
        let service = resource_service_name(resource);
        for scope in list(resource, "scopeLogs") {
            for record in list(scope, "logRecords") {
                let time = nanos(record, "timeUnixNano");
                let mut event = base_event(auth, "log", time / 1_000_000);
                set_opt_str(&mut event, "bundle_id", service.clone());
                set_opt_str(&mut event, "severity", severity_text(record));
                set_opt_str(
                    &mut event,
                    "message",
                    record
                        .get("body")
                        .and_then(|b| b.get("stringValue"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                );
                set_opt_str(&mut event, "trace_id", id_field(record, "traceId"));
                set_opt_str(&mut event, "span_id", id_field(record, "spanId"));
                events.push(event);
            }
        }
    }
    events
}

/// Converts an OTLP metrics export payload: one data point → one event payload.
pub fn convert_metrics(auth: &ProjectAuth, payload: &Value) -> Vec<Map<String, Value>> {
    let mut events = vec![];
    for resource in list(payload, "resourceMetrics") {
        let service = resource_service_name(resource);
        for scope in list(resource, "scopeMetrics") {
            for metric in list(scope, "metrics") {
                let name = metric.get("name").and_then(Value::as_str).unwrap_or("");
                let unit = metric.get("unit").and_then(Value::as_str);
                for point in data_points(metric) {
                    let time = nanos(point, "timeUnixNano");
                    let mut event = base_event(auth, "metric", time / 1_000_000);
                    set_opt_str(&mut event, "bundle_id", service.clone());
                    event.insert("metric_name".to_string(), json!(name));
                    if let Some(unit) = unit {
                        event.insert("metric_unit".to_string(), json!(unit));
                    }
                    if let Some(value) = point_value(point) {
                        event.insert("metric_value".to_string(), json!(value));
                    }
                    events.push(event);
                }
            }
        }
    }
    events
}

fn base_event(auth: &ProjectAuth, event_type: &str, timestamp_millis: i64) -> Map<String, Value> {
    let mut event = Map::new();
    event.insert("event_id".to_string(), json!(Uuid::now_v7().to_string()));
    event.insert("timestamp".to_string(), json!(timestamp_millis));
    event.insert("event_type".to_string(), json!(event_type));
    event.insert("project_id".to_string(), json!(auth.project_id));
    event.insert("environment".to_string(), json!(auth.environment));
    event
}

fn set_opt_str(event: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        event.insert(key.to_string(), json!(value));
    }
}

fn list<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|v| v.iter())
        .unwrap_or_default()
}

/// `service.name` from the resource attributes.
fn resource_service_name(resource: &Value) -> Option<String> {
    let attributes = resource.get("resource")?.get("attributes")?.as_array()?;
    attributes
        .iter()
        .find(|attr| attr.get("key").and_then(Value::as_str) == Some("service.name"))
        .and_then(|attr| attr.get("value")?.get("stringValue")?.as_str())
        .map(str::to_string)
}

/// Ids arrive as base64-encoded bytes; stored as lowercase hex.
fn id_field(value: &Value, key: &str) -> Option<String> {
    let encoded = value.get(key)?.as_str()?;
    if encoded.is_empty() {
        return None;
    }
    let bytes = base64::decode(encoded).ok()?;
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in &bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    Some(hex)
}

/// Unix-nano fields arrive as JSON strings (proto3 int64 mapping).
fn nanos(value: &Value, key: &str) -> i64 {
    match value.get(key) {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn span_status(status: Option<&Value>) -> &'static str {
    let code = status
        .and_then(|s| s.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("");
    match code {
        "STATUS_CODE_OK" => "ok",
        "STATUS_CODE_ERROR" => "error",
        _ => "unset",
    }
}

/// `severityText` lowercased into our domain; OTLP's `warn` maps to `warning`.
fn severity_text(record: &Value) -> Option<String> {
    let text = record.get("severityText")?.as_str()?.to_lowercase();
    let normalized = match text.as_str() {
        "warn" => "warning",
        other => other,
    };
    matches!(
        normalized,
        "trace" | "debug" | "info" | "warning" | "error" | "fatal"
    )
    .then(|| normalized.to_string())
}

fn data_points<'a>(metric: &'a Value) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
    for kind in ["gauge", "sum", "histogram"] {
        if let Some(points) = metric
            .get(kind)
            .and_then(|k| k.get("dataPoints"))
            .and_then(Value::as_array)
        {
            return Box::new(points.iter());
        }
    }
    Box::new(std::iter::empty())
}

fn point_value(point: &Value) -> Option<f64> {
    if let Some(v) = point.get("asDouble").and_then(Value::as_f64) {
        return Some(v);
    }
    match point.get("asInt") {
        Some(Value::String(s)) => s.parse().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => point.get("sum").and_then(Value::as_f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn auth() -> ProjectAuth {
        ProjectAuth {
            organization_id: "org-a".into(),
            project_id: "proj-a".into(),
            environment: "production".into(),
        }
    }

    #[test]
    fn converts_a_span() {
        // traceId/spanId are base64 of 16/8 bytes
        let payload = json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [
                        { "key": "service.name", "value": { "stringValue": "checkout" } }
                    ]
                },
                "scopeSpans": [{
                    "spans": [{
                        "traceId": "AAECAwQFBgcICQoLDA0ODw==",
                        "spanId": "AAECAwQFBgc=",
                        "name": "GET /users",
                        "startTimeUnixNano": "1700000000000000000",
                        "endTimeUnixNano": "1700000000250000000",
                        "status": { "code": "STATUS_CODE_OK" }
                    }]
                }]
            }]
        });

        let events = convert_traces(&auth(), &payload);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event["event_type"], "span");
        assert_eq!(event["timestamp"], json!(1_700_000_000_000i64));
        assert_eq!(event["duration_ms"], json!(250.0));
        assert_eq!(event["operation"], "GET /users");
        assert_eq!(event["span_status"], "ok");
        assert_eq!(event["bundle_id"], "checkout");
        assert_eq!(event["trace_id"], "000102030405060708090a0b0c0d0e0f");
        assert_eq!(event["span_id"], "0001020304050607");
        assert!(event.contains_key("event_id"));
        // one event per span; the payload validates against the schema
        assert!(event_schema::validate(event).is_empty());
    }

    #[test]
    fn converts_a_log_record() {
        let payload = json!({
            "resourceLogs": [{
                "resource": { "attributes": [] },
                "scopeLogs": [{
                    "logRecords": [{
                        "timeUnixNano": "1700000001000000000",
                        "severityText": "WARN",
                        "body": { "stringValue": "disk almost full" }
                    }]
                }]
            }]
        });

        let events = convert_logs(&auth(), &payload);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event["event_type"], "log");
        assert_eq!(event["severity"], "warning");
        assert_eq!(event["message"], "disk almost full");
        assert_eq!(event["timestamp"], json!(1_700_000_001_000i64));
        assert!(event_schema::validate(event).is_empty());
    }

    #[test]
    fn converts_metric_data_points() {
        let payload = json!({
            "resourceMetrics": [{
                "scopeMetrics": [{
                    "metrics": [{
                        "name": "http.request.duration",
                        "unit": "ms",
                        "gauge": {
                            "dataPoints": [
                                { "timeUnixNano": "1700000000000000000", "asDouble": 12.5 },
                                { "timeUnixNano": "1700000001000000000", "asInt": "42" }
                            ]
                        }
                    }]
                }]
            }]
        });

        let events = convert_metrics(&auth(), &payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["metric_value"], json!(12.5));
        assert_eq!(events[1]["metric_value"], json!(42.0));
        for event in &events {
            assert_eq!(event["event_type"], "metric");
            assert_eq!(event["metric_name"], "http.request.duration");
            assert_eq!(event["metric_unit"], "ms");
            assert!(event_schema::validate(event).is_empty());
        }
    }

    #[test]
    fn malformed_payloads_convert_to_nothing() {
        assert!(convert_traces(&auth(), &json!({})).is_empty());
        assert!(convert_logs(&auth(), &json!({"resourceLogs": "nope"})).is_empty());
        assert!(convert_metrics(&auth(), &json!(null)).is_empty());
    }

    #[test]
    fn unknown_severity_is_dropped() {
        let payload = json!({
            "resourceLogs": [{
                "scopeLogs": [{
                    "logRecords": [{
                        "timeUnixNano": "1700000001000000000",
                        "severityText": "LOUD",
                        "body": { "stringValue": "???" }
                    }]
                }]
            }]
        });
        let events = convert_logs(&auth(), &payload);
        assert!(!events[0].contains_key("severity"));
    }
}
