//! Mapping between [`WideEvent`] rows and Arrow record batches.

use crate::{arrow_schema, column_type, set_float, set_int, set_string, ColumnType};
use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{Fields, Schema};
use arrow::record_batch::RecordBatch;
use data_types::{FieldValue, WideEvent};
use snafu::{OptionExt, ResultExt, Snafu};
use std::sync::Arc;

/// Errors converting between rows and record batches.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Failed to assemble record batch: {}", source))]
    BuildBatch { source: arrow::error::ArrowError },

    #[snafu(display("Column '{}' has unexpected physical type", column))]
    ColumnType { column: String },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Encodes a slice of events into one record batch in canonical column order.
pub fn to_record_batch(events: &[WideEvent]) -> Result<RecordBatch> {
    let schema = arrow_schema();
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());

    for field in schema.fields() {
        let name = field.name().as_str();
        let column = column_type(name).expect("schema field is a known column");
        let array: ArrayRef = match column {
            ColumnType::Utf8 => {
                let values: Vec<Option<String>> = events
                    .iter()
                    .map(|event| match event.field(name) {
                        Some(FieldValue::Str(s)) => Some(s.to_string()),
                        Some(other) => Some(other.render()),
                        None => None,
                    })
                    .collect();
                Arc::new(StringArray::from(values))
            }
            ColumnType::Int64 => {
                let values: Vec<Option<i64>> = events
                    .iter()
                    .map(|event| match event.field(name) {
                        Some(FieldValue::Int(i)) => Some(i),
                        _ => None,
                    })
                    .collect();
                Arc::new(Int64Array::from(values))
            }
            ColumnType::Float64 => {
                let values: Vec<Option<f64>> = events
                    .iter()
                    .map(|event| match event.field(name) {
                        Some(FieldValue::Float(f)) => Some(f),
                        Some(FieldValue::Int(i)) => Some(i as f64),
                        _ => None,
                    })
                    .collect();
                Arc::new(Float64Array::from(values))
            }
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema, arrays).context(BuildBatchSnafu)
}

/// Decodes a (possibly column-projected) record batch into events.
///
/// Columns absent from the batch stay `None` on the returned rows; the reader
/// overlays partition-path values afterwards where needed.
pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<WideEvent>> {
    let mut events = vec![WideEvent::default(); batch.num_rows()];

    for (index, field) in batch.schema().fields().iter().enumerate() {
        let name = field.name().as_str();
        let Some(column) = column_type(name) else {
            // a foreign column in the file is skipped rather than fatal
            continue;
        };
        let array = batch.column(index);
        match column {
            ColumnType::Utf8 => {
                let values = array
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .context(ColumnTypeSnafu { column: name })?;
                for (row, event) in events.iter_mut().enumerate() {
                    if values.is_valid(row) {
                        set_string(event, name, values.value(row).to_string());
                    }
                }
            }
            ColumnType::Int64 => {
                let values = array
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .context(ColumnTypeSnafu { column: name })?;
                for (row, event) in events.iter_mut().enumerate() {
                    if values.is_valid(row) {
                        set_int(event, name, values.value(row));
                    }
                }
            }
            ColumnType::Float64 => {
                let values = array
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .context(ColumnTypeSnafu { column: name })?;
                for (row, event) in events.iter_mut().enumerate() {
                    if values.is_valid(row) {
                        set_float(event, name, values.value(row));
                    }
                }
            }
        }
    }

    Ok(events)
}

/// A schema restricted to the given columns, preserving canonical order.
pub fn projected_schema(columns: &[&str]) -> Arc<Schema> {
    let full = arrow_schema();
    let fields: Fields = full
        .fields()
        .iter()
        .filter(|field| columns.contains(&field.name().as_str()))
        .cloned()
        .collect();
    Arc::new(Schema::new(fields))
}
