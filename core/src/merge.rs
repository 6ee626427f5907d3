//! Incremental merge of an incoming batch into the latest persisted snapshot.
//!
//! Rows whose content already exists in the snapshot keep their version and
//! ingestion date. Everything else is stamped, appended and deduplicated by
//! the comparison key, so the incoming revision of a key replaces the old one.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{Result, SchemaError};
use crate::schema::{self, VERSION_COLUMN, is_metadata_column};
use crate::version::VersionStamper;

/// Columns that identify a logical row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonKey {
    columns: Vec<String>,
}

impl ComparisonKey {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// Every column of `schema` except the metadata columns.
    pub fn from_schema(schema: &Schema) -> Self {
        Self::new(
            schema
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .filter(|name| !is_metadata_column(name)),
        )
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub batch: RecordBatch,
    /// Incoming rows that were new or changed and received a fresh version.
    pub stamped_rows: usize,
    /// Incoming rows already present in the snapshot.
    pub unchanged_rows: usize,
    /// Rows dropped because a later row carried the same key.
    pub superseded_rows: usize,
}

pub struct IncrementalMerger {
    stamper: VersionStamper,
    as_of: DateTime<Utc>,
    allow_additive_columns: bool,
}

impl IncrementalMerger {
    /// `as_of` is the instant of the logical run; every chunk of the run must
    /// share it.
    pub fn new(stamper: VersionStamper, as_of: DateTime<Utc>) -> Self {
        Self {
            stamper,
            as_of,
            allow_additive_columns: false,
        }
    }

    /// Accept incoming columns the snapshot lacks; snapshot rows get nulls.
    pub fn with_additive_columns(mut self, allow: bool) -> Self {
        self.allow_additive_columns = allow;
        self
    }

    pub fn as_of(&self) -> &DateTime<Utc> {
        &self.as_of
    }

    pub fn merge(
        &self,
        incoming: &RecordBatch,
        existing: &RecordBatch,
        key: &ComparisonKey,
    ) -> Result<MergeOutcome> {
        if existing.num_rows() == 0 {
            return self.bootstrap(incoming, key);
        }
        check_key_columns(incoming, existing, key)?;
        // only the last revision of each incoming key takes part in the diff
        let offered_rows = incoming.num_rows();
        let incoming = &dedup_keep_last(incoming, key)?;
        let duplicates = offered_rows - incoming.num_rows();

        let target = self.target_schema(incoming.schema().as_ref(), existing.schema().as_ref())?;
        let existing = if target.fields().len() > existing.num_columns() {
            schema::widen(existing, &target)?
        } else {
            existing.clone()
        };

        let content: Vec<&str> = target
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .filter(|name| !is_metadata_column(name))
            .collect();
        let converter = row_converter(&existing, &content)?;
        let known = converter.convert_columns(&columns(&existing, &content)?)?;
        let offered = converter.convert_columns(&columns(incoming, &content)?)?;
        let fresh = fresh_indices(&known, &offered);
        let unchanged_rows = incoming.num_rows() - fresh.len();

        if fresh.is_empty() {
            debug!("All {} incoming rows already present", unchanged_rows);
            return Ok(MergeOutcome {
                batch: existing,
                stamped_rows: 0,
                unchanged_rows,
                superseded_rows: duplicates,
            });
        }

        let fresh_rows = take_record_batch(incoming, &UInt32Array::from(fresh))?;
        let stamped = self.stamp(&fresh_rows)?;
        let combined = schema::concat(&target, &[existing, stamped])?;
        let merged = dedup_keep_last(&combined, key)?;
        let superseded_rows = duplicates + combined.num_rows() - merged.num_rows();

        debug!(
            "Merged {} stamped rows, {} unchanged, {} superseded",
            fresh_rows.num_rows(),
            unchanged_rows,
            superseded_rows
        );
        Ok(MergeOutcome {
            superseded_rows,
            batch: merged,
            stamped_rows: fresh_rows.num_rows(),
            unchanged_rows,
        })
    }

    fn bootstrap(&self, incoming: &RecordBatch, key: &ComparisonKey) -> Result<MergeOutcome> {
        require_columns(incoming, key)?;
        let stamped = self.stamp(incoming)?;
        let merged = dedup_keep_last(&stamped, key)?;
        Ok(MergeOutcome {
            superseded_rows: stamped.num_rows() - merged.num_rows(),
            stamped_rows: incoming.num_rows(),
            unchanged_rows: 0,
            batch: merged,
        })
    }

    fn stamp(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        let versions: ArrayRef = Arc::new(self.stamper.stamp_batch(batch, &self.as_of)?);
        schema::set_column(batch, VERSION_COLUMN, versions)
    }

    /// Schema of the merged output: the snapshot's, plus any additive columns.
    fn target_schema(&self, incoming: &Schema, existing: &Schema) -> Result<SchemaRef> {
        for field in existing.fields().iter().filter(|f| !is_metadata_column(f.name())) {
            match incoming.field_with_name(field.name()) {
                Ok(offered) if offered.data_type() != field.data_type() => {
                    return Err(SchemaError::TypeMismatch {
                        column: field.name().clone(),
                        expected: field.data_type().to_string(),
                        found: offered.data_type().to_string(),
                    }
                    .into());
                }
                Ok(_) => {}
                Err(_) => {
                    return Err(SchemaError::SchemaMismatch {
                        reason: format!(
                            "column {} of the existing output is missing from the incoming batch",
                            field.name()
                        ),
                    }
                    .into());
                }
            }
        }

        let added: Vec<Field> = incoming
            .fields()
            .iter()
            .filter(|f| !is_metadata_column(f.name()) && existing.field_with_name(f.name()).is_err())
            .map(|f| f.as_ref().clone().with_nullable(true))
            .collect();
        if added.is_empty() {
            return Ok(Arc::new(existing.clone()));
        }
        if !self.allow_additive_columns {
            let names: Vec<&str> = added.iter().map(|f| f.name().as_str()).collect();
            return Err(SchemaError::SchemaMismatch {
                reason: format!("incoming batch adds columns {}", names.join(", ")),
            }
            .into());
        }

        let fields: Vec<Field> = existing
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .chain(added)
            .collect();
        Ok(Arc::new(Schema::new_with_metadata(fields, existing.metadata().clone())))
    }
}

/// Keeps the last row for every key tuple; nulls compare equal to nulls.
pub fn dedup_keep_last(batch: &RecordBatch, key: &ComparisonKey) -> Result<RecordBatch> {
    let names: Vec<&str> = key.columns().iter().map(String::as_str).collect();
    let converter = row_converter(batch, &names)?;
    let rows = converter.convert_columns(&columns(batch, &names)?)?;

    let mut seen = HashSet::with_capacity(rows.num_rows());
    let mut keep: Vec<u32> = (0..rows.num_rows())
        .rev()
        .filter(|&i| seen.insert(rows.row(i)))
        .map(|i| i as u32)
        .collect();
    if keep.len() == batch.num_rows() {
        return Ok(batch.clone());
    }
    keep.reverse();
    Ok(take_record_batch(batch, &UInt32Array::from(keep))?)
}

fn fresh_indices(known: &Rows, offered: &Rows) -> Vec<u32> {
    let index: HashSet<_> = known.iter().collect();
    offered
        .iter()
        .enumerate()
        .filter(|(_, row)| !index.contains(row))
        .map(|(i, _)| i as u32)
        .collect()
}

fn check_key_columns(incoming: &RecordBatch, existing: &RecordBatch, key: &ComparisonKey) -> Result<()> {
    require_columns(incoming, key)?;
    require_columns(existing, key)?;
    for name in key.columns() {
        let offered = incoming.schema().field_with_name(name)?.data_type().clone();
        let expected = existing.schema().field_with_name(name)?.data_type().clone();
        if offered != expected {
            return Err(SchemaError::TypeMismatch {
                column: name.clone(),
                expected: expected.to_string(),
                found: offered.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn require_columns(batch: &RecordBatch, key: &ComparisonKey) -> Result<()> {
    match key.columns().iter().find(|c| batch.column_by_name(c).is_none()) {
        Some(missing) => Err(SchemaError::MissingColumn {
            column: missing.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

fn columns(batch: &RecordBatch, names: &[&str]) -> Result<Vec<ArrayRef>> {
    names
        .iter()
        .map(|name| {
            batch.column_by_name(name).cloned().ok_or_else(|| {
                SchemaError::MissingColumn {
                    column: name.to_string(),
                }
                .into()
            })
        })
        .collect()
}

fn row_converter(batch: &RecordBatch, names: &[&str]) -> Result<RowConverter> {
    let fields = columns(batch, names)?
        .iter()
        .map(|c| SortField::new(c.data_type().clone()))
        .collect();
    Ok(RowConverter::new(fields)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use crate::version::VersionMode;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;
    use chrono::TimeZone;

    fn as_of(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 6, 0, 0).unwrap()
    }

    fn merger(day: u32) -> IncrementalMerger {
        IncrementalMerger::new(VersionStamper::default(), as_of(day))
    }

    fn plans(rows: &[(Option<&str>, i64)]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("PlanId", DataType::Utf8, true),
            Field::new("Rate", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
                Arc::new(Int64Array::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
            ],
        )
        .unwrap()
    }

    fn strings<'a>(batch: &'a RecordBatch, name: &str) -> &'a StringArray {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
    }

    fn rate_of(batch: &RecordBatch, plan: &str) -> Vec<i64> {
        let ids = strings(batch, "PlanId");
        let rates = batch
            .column_by_name("Rate")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        (0..batch.num_rows())
            .filter(|&i| ids.is_valid(i) && ids.value(i) == plan)
            .map(|i| rates.value(i))
            .collect()
    }

    fn version_of(batch: &RecordBatch, plan: &str) -> String {
        let ids = strings(batch, "PlanId");
        let versions = strings(batch, VERSION_COLUMN);
        (0..batch.num_rows())
            .find(|&i| ids.is_valid(i) && ids.value(i) == plan)
            .map(|i| versions.value(i).to_string())
            .unwrap()
    }

    fn plan_key() -> ComparisonKey {
        ComparisonKey::new(["PlanId"])
    }

    #[test]
    fn test_bootstrap_stamps_everything() {
        let incoming = plans(&[(Some("P1"), 10), (Some("P2"), 20)]);
        let empty = RecordBatch::new_empty(Arc::new(Schema::empty()));

        let outcome = merger(1).merge(&incoming, &empty, &plan_key()).unwrap();

        assert_eq!(outcome.batch.num_rows(), 2);
        assert_eq!(outcome.stamped_rows, 2);
        assert_eq!(outcome.unchanged_rows, 0);
        assert_eq!(strings(&outcome.batch, VERSION_COLUMN).null_count(), 0);
        assert_eq!(rate_of(&outcome.batch, "P2"), vec![20]);
    }

    #[test]
    fn test_remerge_is_idempotent() {
        let incoming = plans(&[(Some("P1"), 10), (Some("P2"), 20)]);
        let empty = RecordBatch::new_empty(incoming.schema());
        let first = merger(1).merge(&incoming, &empty, &plan_key()).unwrap();

        let second = merger(2).merge(&incoming, &first.batch, &plan_key()).unwrap();

        assert_eq!(second.batch, first.batch);
        assert_eq!(second.stamped_rows, 0);
        assert_eq!(second.unchanged_rows, 2);
    }

    #[test]
    fn test_incoming_wins_on_conflict() {
        let existing = merger(1)
            .merge(
                &plans(&[(Some("P1"), 10), (Some("P2"), 20)]),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &plan_key(),
            )
            .unwrap()
            .batch;
        let p2_version = version_of(&existing, "P2");

        let outcome = merger(2)
            .merge(&plans(&[(Some("P1"), 11), (Some("P2"), 20)]), &existing, &plan_key())
            .unwrap();

        assert_eq!(outcome.batch.num_rows(), 2);
        assert_eq!(rate_of(&outcome.batch, "P1"), vec![11]);
        assert_eq!(outcome.stamped_rows, 1);
        assert_eq!(outcome.unchanged_rows, 1);
        assert_eq!(outcome.superseded_rows, 1);
        // unchanged rows keep their original identifier
        assert_eq!(version_of(&outcome.batch, "P2"), p2_version);
        assert_ne!(version_of(&outcome.batch, "P1"), version_of(&existing, "P1"));
    }

    #[test]
    fn test_key_injective_with_null_keys() {
        let incoming = plans(&[(None, 1), (Some("P1"), 2), (None, 3), (Some("P1"), 4)]);
        let empty = RecordBatch::new_empty(incoming.schema());

        let outcome = merger(1).merge(&incoming, &empty, &plan_key()).unwrap();

        assert_eq!(outcome.batch.num_rows(), 2);
        assert_eq!(outcome.superseded_rows, 2);
        assert_eq!(rate_of(&outcome.batch, "P1"), vec![4]);
        let rates = outcome
            .batch
            .column_by_name("Rate")
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert!(rates.values().contains(&3));
    }

    #[test]
    fn test_null_content_matches_existing() {
        let incoming = plans(&[(None, 1)]);
        let first = merger(1)
            .merge(&incoming, &RecordBatch::new_empty(incoming.schema()), &plan_key())
            .unwrap();

        let second = merger(2).merge(&incoming, &first.batch, &plan_key()).unwrap();
        assert_eq!(second.stamped_rows, 0);
    }

    #[test]
    fn test_chunked_merge_matches_single_pass() {
        let rows: Vec<(Option<String>, i64)> =
            (0..1_000).map(|i| (Some(format!("P{}", i % 700)), i)).collect();
        let borrowed: Vec<(Option<&str>, i64)> = rows.iter().map(|(p, r)| (p.as_deref(), *r)).collect();
        let incoming = plans(&borrowed);
        let empty = RecordBatch::new_empty(incoming.schema());
        let merger = merger(1);

        let single = merger.merge(&incoming, &empty, &plan_key()).unwrap().batch;

        let mut chunked = empty.clone();
        for chunk in schema::chunks(&incoming, 333) {
            chunked = merger.merge(&chunk, &chunked, &plan_key()).unwrap().batch;
        }

        assert_eq!(single.num_rows(), 700);
        assert_eq!(chunked.num_rows(), 700);
        for plan in ["P0", "P299", "P699"] {
            assert_eq!(rate_of(&single, plan), rate_of(&chunked, plan));
            assert_eq!(version_of(&single, plan), version_of(&chunked, plan));
        }
    }

    #[test]
    fn test_repeated_key_across_chunks_keeps_last_revision() {
        let incoming = plans(&[
            (Some("P2"), 1),
            (Some("P1"), 11),
            (Some("P1"), 10),
            (Some("P1"), 11),
        ]);
        let empty = RecordBatch::new_empty(incoming.schema());
        let merger = merger(1);

        let single = merger.merge(&incoming, &empty, &plan_key()).unwrap().batch;

        let mut chunked = empty.clone();
        for chunk in schema::chunks(&incoming, 2) {
            chunked = merger.merge(&chunk, &chunked, &plan_key()).unwrap().batch;
        }

        assert_eq!(rate_of(&single, "P1"), vec![11]);
        assert_eq!(rate_of(&chunked, "P1"), vec![11]);
        assert_eq!(version_of(&single, "P1"), version_of(&chunked, "P1"));
        assert_eq!(chunked.num_rows(), 2);
    }

    #[test]
    fn test_earlier_duplicate_does_not_override_known_revision() {
        let existing = merger(1)
            .merge(
                &plans(&[(Some("P1"), 11)]),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &plan_key(),
            )
            .unwrap()
            .batch;

        let outcome = merger(2)
            .merge(&plans(&[(Some("P1"), 10), (Some("P1"), 11)]), &existing, &plan_key())
            .unwrap();

        assert_eq!(rate_of(&outcome.batch, "P1"), vec![11]);
        assert_eq!(outcome.stamped_rows, 0);
        assert_eq!(outcome.unchanged_rows, 1);
        assert_eq!(outcome.superseded_rows, 1);
        assert_eq!(version_of(&outcome.batch, "P1"), version_of(&existing, "P1"));
    }

    #[test]
    fn test_key_type_drift_is_type_mismatch() {
        let existing = merger(1)
            .merge(
                &plans(&[(Some("P1"), 10)]),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &plan_key(),
            )
            .unwrap()
            .batch;
        let drifted = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("PlanId", DataType::Int64, true),
                Field::new("Rate", DataType::Int64, false),
            ])),
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(Int64Array::from(vec![10])),
            ],
        )
        .unwrap();

        let err = merger(2).merge(&drifted, &existing, &plan_key()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Schema(SchemaError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_key_column() {
        let err = merger(1)
            .merge(
                &plans(&[(Some("P1"), 10)]),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &ComparisonKey::new(["IssuerId"]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Schema(SchemaError::MissingColumn { .. })
        ));
    }

    fn with_network(batch: &RecordBatch) -> RecordBatch {
        let network: ArrayRef = Arc::new(StringArray::from(vec!["N1"; batch.num_rows()]));
        schema::set_column(batch, "NetworkId", network).unwrap()
    }

    #[test]
    fn test_additive_columns_rejected_by_default() {
        let existing = merger(1)
            .merge(
                &plans(&[(Some("P1"), 10)]),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &plan_key(),
            )
            .unwrap()
            .batch;

        let err = merger(2)
            .merge(&with_network(&plans(&[(Some("P2"), 5)])), &existing, &plan_key())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Schema(SchemaError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_additive_columns_backfill_nulls() {
        let existing = merger(1)
            .merge(
                &plans(&[(Some("P1"), 10)]),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &plan_key(),
            )
            .unwrap()
            .batch;

        let outcome = merger(2)
            .with_additive_columns(true)
            .merge(&with_network(&plans(&[(Some("P2"), 5)])), &existing, &plan_key())
            .unwrap();

        assert_eq!(outcome.batch.num_rows(), 2);
        let network = strings(&outcome.batch, "NetworkId");
        assert_eq!(network.null_count(), 1);
        assert_eq!(network.value(1), "N1");
    }

    #[test]
    fn test_dropped_column_is_schema_mismatch() {
        let existing = merger(1)
            .merge(
                &with_network(&plans(&[(Some("P1"), 10)])),
                &RecordBatch::new_empty(Arc::new(Schema::empty())),
                &plan_key(),
            )
            .unwrap()
            .batch;

        let err = merger(2)
            .with_additive_columns(true)
            .merge(&plans(&[(Some("P1"), 10)]), &existing, &plan_key())
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Schema(SchemaError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_content_only_versions_are_reproducible() {
        let stamper = VersionStamper::new(VersionMode::ContentOnly, "insert");
        let incoming = plans(&[(Some("P1"), 10)]);
        let empty = RecordBatch::new_empty(incoming.schema());

        let a = IncrementalMerger::new(stamper.clone(), as_of(1))
            .merge(&incoming, &empty, &plan_key())
            .unwrap();
        let b = IncrementalMerger::new(stamper, as_of(9))
            .merge(&incoming, &empty, &plan_key())
            .unwrap();
        assert_eq!(version_of(&a.batch, "P1"), version_of(&b.batch, "P1"));
    }

    #[test]
    fn test_comparison_key_from_schema_skips_metadata() {
        let schema = Schema::new(vec![
            Field::new("PlanId", DataType::Utf8, true),
            Field::new(schema::INGEST_DATE_COLUMN, schema::ingest_date_type(), false),
            Field::new("Rate", DataType::Int64, true),
            Field::new(VERSION_COLUMN, DataType::Utf8, false),
        ]);
        assert_eq!(ComparisonKey::from_schema(&schema).columns(), ["PlanId", "Rate"]);
    }
}
