//! The column list, in on-disk order.

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Primitive type of a wide-event column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// UTF-8 string.
    Utf8,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
}

/// Every column of the wide-event record, in the order they appear on disk.
///
/// JSON-carrying columns (`stack_trace`, `tags`, `context`, `breadcrumbs`)
/// are stored as UTF-8 strings.
pub const COLUMNS: &[(&str, ColumnType)] = &[
    ("event_id", ColumnType::Utf8),
    ("timestamp", ColumnType::Int64),
    ("organization_id", ColumnType::Utf8),
    ("project_id", ColumnType::Utf8),
    ("event_type", ColumnType::Utf8),
    ("fingerprint", ColumnType::Utf8),
    ("severity", ColumnType::Utf8),
    ("message", ColumnType::Utf8),
    ("exception_type", ColumnType::Utf8),
    ("stack_trace", ColumnType::Utf8),
    ("app_version", ColumnType::Utf8),
    ("app_build", ColumnType::Utf8),
    ("bundle_id", ColumnType::Utf8),
    ("environment", ColumnType::Utf8),
    ("device_model", ColumnType::Utf8),
    ("device_id", ColumnType::Utf8),
    ("os_name", ColumnType::Utf8),
    ("os_version", ColumnType::Utf8),
    ("locale", ColumnType::Utf8),
    ("timezone", ColumnType::Utf8),
    ("memory_used", ColumnType::Int64),
    ("memory_total", ColumnType::Int64),
    ("disk_free", ColumnType::Int64),
    ("battery_level", ColumnType::Float64),
    ("trace_id", ColumnType::Utf8),
    ("span_id", ColumnType::Utf8),
    ("parent_span_id", ColumnType::Utf8),
    ("operation", ColumnType::Utf8),
    ("duration_ms", ColumnType::Float64),
    ("span_status", ColumnType::Utf8),
    ("metric_name", ColumnType::Utf8),
    ("metric_value", ColumnType::Float64),
    ("metric_unit", ColumnType::Utf8),
    ("user_id", ColumnType::Utf8),
    ("session_id", ColumnType::Utf8),
    ("tags", ColumnType::Utf8),
    ("context", ColumnType::Utf8),
    ("breadcrumbs", ColumnType::Utf8),
];

/// Fields that must be present and non-empty at ingest.
pub const REQUIRED_COLUMNS: &[&str] = &["event_id", "timestamp", "project_id", "event_type"];

/// Columns whose payload values may arrive as structured JSON and are encoded
/// to strings on normalization.
pub const JSON_COLUMNS: &[&str] = &["stack_trace", "tags", "context", "breadcrumbs"];

static ARROW_SCHEMA: Lazy<SchemaRef> = Lazy::new(|| {
    let fields: Vec<Field> = COLUMNS
        .iter()
        .map(|(name, column_type)| {
            let data_type = match column_type {
                ColumnType::Utf8 => DataType::Utf8,
                ColumnType::Int64 => DataType::Int64,
                ColumnType::Float64 => DataType::Float64,
            };
            Field::new(*name, data_type, true)
        })
        .collect();
    Arc::new(Schema::new(fields))
});

/// The full Arrow schema in canonical column order.
pub fn arrow_schema() -> SchemaRef {
    Arc::clone(&ARROW_SCHEMA)
}

/// Type of a column by name, if it exists.
pub fn column_type(name: &str) -> Option<ColumnType> {
    COLUMNS
        .iter()
        .find(|(column, _)| *column == name)
        .map(|(_, column_type)| *column_type)
}

/// Ordinal of a column in the canonical order, if it exists.
pub fn column_index(name: &str) -> Option<usize> {
    COLUMNS.iter().position(|(column, _)| *column == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::WideEvent;

    #[test]
    fn schema_matches_column_list() {
        let schema = arrow_schema();
        assert_eq!(schema.fields().len(), COLUMNS.len());
        for (field, (name, _)) in schema.fields().iter().zip(COLUMNS.iter()) {
            assert_eq!(field.name(), name);
            assert!(field.is_nullable());
        }
    }

    #[test]
    fn every_column_resolves_on_the_record_type() {
        // a fully populated event must expose every schema column via `field`
        let event = WideEvent {
            event_id: "e".into(),
            timestamp: 1,
            organization_id: Some("o".into()),
            project_id: "p".into(),
            fingerprint: Some("f".into()),
            severity: Some(data_types::Severity::Info),
            message: Some("m".into()),
            exception_type: Some("x".into()),
            stack_trace: Some("[]".into()),
            app_version: Some("1".into()),
            app_build: Some("1".into()),
            bundle_id: Some("b".into()),
            environment: Some("prod".into()),
            device_model: Some("d".into()),
            device_id: Some("d".into()),
            os_name: Some("os".into()),
            os_version: Some("1".into()),
            locale: Some("en".into()),
            timezone: Some("UTC".into()),
            memory_used: Some(1),
            memory_total: Some(1),
            disk_free: Some(1),
            battery_level: Some(1.0),
            trace_id: Some("t".into()),
            span_id: Some("s".into()),
            parent_span_id: Some("s".into()),
            operation: Some("op".into()),
            duration_ms: Some(1.0),
            span_status: Some("ok".into()),
            metric_name: Some("m".into()),
            metric_value: Some(1.0),
            metric_unit: Some("ms".into()),
            user_id: Some("u".into()),
            session_id: Some("s".into()),
            tags: Some("{}".into()),
            context: Some("{}".into()),
            breadcrumbs: Some("[]".into()),
            ..Default::default()
        };
        for (name, _) in COLUMNS {
            assert!(event.field(name).is_some(), "column {name} not resolvable");
        }
    }

    #[test]
    fn required_columns_are_known() {
        for name in REQUIRED_COLUMNS {
            assert!(column_index(name).is_some());
        }
    }
}
