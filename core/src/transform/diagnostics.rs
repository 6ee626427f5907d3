//! Post-write data quality summary. Never fails the caller.

use std::collections::HashSet;

use arrow::array::{Array, ArrayRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub rows: usize,
    /// Percentage of nulls per column, for columns holding any.
    pub null_percentages: Vec<(String, f64)>,
    /// Rows whose values over `columns` repeat an earlier row.
    pub duplicate_rows: usize,
}

pub fn summarize(batch: &RecordBatch, columns: &[String]) -> Result<Diagnostics> {
    let rows = batch.num_rows();
    let null_percentages = batch
        .schema()
        .fields()
        .iter()
        .zip(batch.columns())
        .filter(|(_, c)| c.null_count() > 0)
        .map(|(f, c)| (f.name().clone(), c.null_count() as f64 * 100.0 / rows as f64))
        .collect();

    let arrays: Vec<ArrayRef> = columns
        .iter()
        .filter_map(|name| batch.column_by_name(name).cloned())
        .collect();
    let duplicate_rows = if arrays.is_empty() {
        0
    } else {
        let converter = RowConverter::new(
            arrays
                .iter()
                .map(|a| SortField::new(a.data_type().clone()))
                .collect(),
        )?;
        let encoded = converter.convert_columns(&arrays)?;
        let distinct: HashSet<_> = encoded.iter().collect();
        rows - distinct.len()
    };

    Ok(Diagnostics {
        rows,
        null_percentages,
        duplicate_rows,
    })
}

/// Logs the summary of `batch` under `label`; failures only warn.
pub fn report(label: &str, batch: &RecordBatch, columns: &[String]) -> Option<Diagnostics> {
    match summarize(batch, columns) {
        Ok(diagnostics) => {
            info!("{}: {} rows", label, diagnostics.rows);
            for (column, pct) in &diagnostics.null_percentages {
                info!("{}: column {} is {:.2}% null", label, column, pct);
            }
            if diagnostics.duplicate_rows > 0 {
                warn!("{}: {} duplicate rows", label, diagnostics.duplicate_rows);
            }
            Some(diagnostics)
        }
        Err(e) => {
            warn!("{}: diagnostics unavailable: {}", label, e);
            None
        }
    }
}
