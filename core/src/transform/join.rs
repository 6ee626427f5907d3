use std::collections::HashMap;

use arrow::array::{Array, ArrayRef, StringArray, UInt32Array};
use arrow::compute::{cast, take, take_record_batch};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use tracing::info;

use crate::errors::{Result, SchemaError};
use crate::schema;

/// Inner equi-join of `left` with `right` on `on`, appending `columns` of `right`.
///
/// Keys are compared by their string form. Null keys never match and rows
/// without a partner on the other side are dropped. One left row yields one
/// output row per matching right row.
pub fn inner_join(
    left: &RecordBatch,
    right: &RecordBatch,
    on: &str,
    columns: &[String],
) -> Result<RecordBatch> {
    let left_keys = key_strings(left, on)?;
    let right_keys = key_strings(right, on)?;

    let mut lookup: HashMap<&str, Vec<u32>> = HashMap::new();
    for (i, key) in right_keys.iter().enumerate() {
        if let Some(key) = key {
            lookup.entry(key).or_default().push(i as u32);
        }
    }

    let mut left_take = Vec::new();
    let mut right_take = Vec::new();
    for (i, key) in left_keys.iter().enumerate() {
        if let Some(matches) = key.and_then(|k| lookup.get(k)) {
            for &j in matches {
                left_take.push(i as u32);
                right_take.push(j);
            }
        }
    }

    let mut joined = take_record_batch(left, &UInt32Array::from(left_take))?;
    let right_take = UInt32Array::from(right_take);
    for name in columns {
        let column = right
            .column_by_name(name)
            .ok_or_else(|| SchemaError::MissingColumn {
                column: name.clone(),
            })?;
        let taken: ArrayRef = take(column.as_ref(), &right_take, None)?;
        joined = schema::set_column(&joined, name, taken)?;
    }

    let unmatched = (0..left.num_rows())
        .filter(|&i| left_keys.is_null(i) || !lookup.contains_key(left_keys.value(i)))
        .count();
    info!(
        "Joined on {}: {} left rows, {} right rows, {} output rows, {} left rows without a match",
        on,
        left.num_rows(),
        right.num_rows(),
        joined.num_rows(),
        unmatched
    );
    Ok(joined)
}

fn key_strings(batch: &RecordBatch, on: &str) -> Result<StringArray> {
    let column = batch
        .column_by_name(on)
        .ok_or_else(|| SchemaError::MissingColumn {
            column: on.to_string(),
        })?;
    let as_text = cast(column.as_ref(), &DataType::Utf8)?;
    as_text
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| {
            SchemaError::Cast {
                column: on.to_string(),
                reason: "join key is not representable as text".to_string(),
            }
            .into()
        })
}
