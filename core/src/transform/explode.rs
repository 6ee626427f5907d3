use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, UInt32Array};
use arrow::compute::{cast, take};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tracing::debug;

use crate::errors::{Result, SchemaError};

/// Splits `column` on `separator` and emits one row per non-empty piece.
///
/// The pieces are trimmed and stored in `into`, which replaces `column` as
/// the last column. Rows whose list is null or blank produce no output.
pub fn explode(batch: &RecordBatch, column: &str, into: &str, separator: &str) -> Result<RecordBatch> {
    let source = batch
        .column_by_name(column)
        .ok_or_else(|| SchemaError::MissingColumn {
            column: column.to_string(),
        })?;
    let text = cast(source.as_ref(), &DataType::Utf8)?;
    let lists = text
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| SchemaError::Cast {
            column: column.to_string(),
            reason: "list column is not representable as text".to_string(),
        })?;

    let mut parents = Vec::new();
    let mut pieces = Vec::new();
    for (row, list) in lists.iter().enumerate() {
        for piece in list.into_iter().flat_map(|l| l.split(separator)) {
            let piece = piece.trim();
            if !piece.is_empty() {
                parents.push(row as u32);
                pieces.push(piece.to_string());
            }
        }
    }

    let parents = UInt32Array::from(parents);
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (field, array) in schema.fields().iter().zip(batch.columns()) {
        if field.name() != column {
            fields.push(field.as_ref().clone());
            columns.push(take(array.as_ref(), &parents, None)?);
        }
    }
    fields.push(Field::new(into, DataType::Utf8, false));
    columns.push(Arc::new(StringArray::from(pieces)));

    let exploded = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
    debug!(
        "Exploded {} rows of {} into {} rows of {}",
        batch.num_rows(),
        column,
        exploded.num_rows(),
        into
    );
    Ok(exploded)
}
