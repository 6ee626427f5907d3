//! Column projection, typing and metadata helpers shared by every layer transform.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray, new_null_array};
use arrow::compute::{CastOptions, cast_with_options, concat_batches};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::util::display::FormatOptions;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::SchemaField;
use crate::errors::{Result, SchemaError};

pub const INGEST_DATE_COLUMN: &str = "ingestDate";
pub const PARTITION_DATE_COLUMN: &str = "partitionDate";
pub const VERSION_COLUMN: &str = "version";

pub const METADATA_COLUMNS: [&str; 3] = [INGEST_DATE_COLUMN, PARTITION_DATE_COLUMN, VERSION_COLUMN];

pub fn is_metadata_column(name: &str) -> bool {
    METADATA_COLUMNS.contains(&name)
}

pub fn ingest_date_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, None)
}

pub fn declared_schema(fields: &[SchemaField]) -> SchemaRef {
    Arc::new(Schema::new(
        fields
            .iter()
            .map(|f| Field::new(&f.name, f.data_type.to_arrow(), f.nullable))
            .collect::<Vec<_>>(),
    ))
}

/// Keeps exactly the declared columns, in declared order, cast to their declared types.
///
/// A missing column is an error unless it is marked optional, in which case it
/// is filled with nulls. Nullable columns are cast leniently (unparseable values
/// become null and are reported); non-nullable columns must cast cleanly.
pub fn project_and_cast(batch: &RecordBatch, fields: &[SchemaField]) -> Result<RecordBatch> {
    let schema = declared_schema(fields);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.len());

    for field in fields {
        let target = field.data_type.to_arrow();
        let column = match batch.column_by_name(&field.name) {
            Some(column) => cast_column(&field.name, column, &target, field.nullable)?,
            None if field.optional => new_null_array(&target, batch.num_rows()),
            None => {
                return Err(SchemaError::MissingColumn {
                    column: field.name.clone(),
                }
                .into());
            }
        };

        if !field.nullable && column.null_count() > 0 {
            return Err(SchemaError::Cast {
                column: field.name.clone(),
                reason: format!(
                    "{} null values in a non-nullable column",
                    column.null_count()
                ),
            }
            .into());
        }
        columns.push(column);
    }

    Ok(RecordBatch::try_new(schema, columns)?)
}

pub(crate) fn cast_column(
    name: &str,
    column: &ArrayRef,
    target: &DataType,
    lenient: bool,
) -> Result<ArrayRef> {
    if column.data_type() == target {
        return Ok(column.clone());
    }

    let options = CastOptions {
        safe: lenient,
        format_options: FormatOptions::default(),
    };
    let cast = cast_with_options(column.as_ref(), target, &options).map_err(|e| SchemaError::Cast {
        column: name.to_string(),
        reason: e.to_string(),
    })?;

    let coerced = cast.null_count().saturating_sub(column.null_count());
    if coerced > 0 {
        warn!(
            "Column {} has {} values that could not be cast to {}; stored as null",
            name, coerced, target
        );
    }
    Ok(cast)
}

/// Sets `ingestDate` and `partitionDate` on every row, replacing existing values.
pub fn with_ingest_metadata(
    batch: &RecordBatch,
    as_of: &DateTime<Utc>,
    partition: &str,
) -> Result<RecordBatch> {
    let rows = batch.num_rows();
    let ingest_date: ArrayRef = Arc::new(TimestampMicrosecondArray::from(vec![
        as_of.timestamp_micros();
        rows
    ]));
    let partition_date: ArrayRef = Arc::new(StringArray::from(vec![partition; rows]));

    let batch = set_column(batch, INGEST_DATE_COLUMN, ingest_date)?;
    set_column(&batch, PARTITION_DATE_COLUMN, partition_date)
}

/// Replaces the named column in place, or appends it when absent.
///
/// Appended columns are always nullable: their values come from another
/// table or from metadata, and a later run may carry nulls where this one
/// did not.
pub fn set_column(batch: &RecordBatch, name: &str, column: ArrayRef) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns = batch.columns().to_vec();
    let field = Field::new(name, column.data_type().clone(), true);

    match schema.index_of(name) {
        Ok(index) => {
            fields[index] = field.with_nullable(fields[index].is_nullable() || column.null_count() > 0);
            columns[index] = column;
        }
        Err(_) => {
            fields.push(field);
            columns.push(column);
        }
    }

    let schema = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Reorders `batch` to `schema`, requiring the same column set and data types.
///
/// Nullability is not a mismatch: a target field becomes nullable when the
/// batch declares it nullable or holds nulls in it.
pub fn conform(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let source = batch.schema();
    if let Some(extra) = source
        .fields()
        .iter()
        .find(|f| schema.field_with_name(f.name()).is_err())
    {
        return Err(SchemaError::SchemaMismatch {
            reason: format!("column {} is not part of the target schema", extra.name()),
        }
        .into());
    }

    let mut columns = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        let column = batch
            .column_by_name(field.name())
            .ok_or_else(|| SchemaError::MissingColumn {
                column: field.name().clone(),
            })?;
        if column.data_type() != field.data_type() {
            return Err(SchemaError::TypeMismatch {
                column: field.name().clone(),
                expected: field.data_type().to_string(),
                found: column.data_type().to_string(),
            }
            .into());
        }
        columns.push(column.clone());
    }

    let schema = relax_nullability(schema, std::slice::from_ref(batch));
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// `schema` with a field marked nullable wherever any of `batches` declares
/// the same column nullable or actually holds a null in it.
fn relax_nullability(schema: &SchemaRef, batches: &[RecordBatch]) -> SchemaRef {
    let needs_relaxing = |field: &Field| {
        batches.iter().any(|b| {
            let declared = b
                .schema()
                .field_with_name(field.name())
                .map(|f| f.is_nullable())
                .unwrap_or(false);
            let observed = b
                .column_by_name(field.name())
                .is_some_and(|c| c.null_count() > 0);
            declared || observed
        })
    };
    if schema
        .fields()
        .iter()
        .all(|f| f.is_nullable() || !needs_relaxing(f))
    {
        return schema.clone();
    }

    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| {
            let nullable = f.is_nullable() || needs_relaxing(f);
            f.as_ref().clone().with_nullable(nullable)
        })
        .collect();
    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

/// Adds null columns for every field of `schema` that `batch` lacks, then conforms.
pub fn widen(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let mut widened = batch.clone();
    for field in schema.fields() {
        if batch.column_by_name(field.name()).is_none() {
            let nulls = new_null_array(field.data_type(), batch.num_rows());
            widened = set_column(&widened, field.name(), nulls)?;
        }
    }
    conform(&widened, &nullable_schema(schema, batch.schema().as_ref()))
}

/// `schema` with every field that `present` lacks marked nullable.
fn nullable_schema(schema: &SchemaRef, present: &Schema) -> SchemaRef {
    let fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| {
            let added = present.field_with_name(f.name()).is_err();
            f.as_ref().clone().with_nullable(f.is_nullable() || added)
        })
        .collect();
    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

/// Concatenates batches after conforming each to `schema`. A field is
/// nullable in the result when it is nullable in any input.
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    let unified = relax_nullability(schema, batches);
    let conformed = batches
        .iter()
        .map(|b| conform(b, &unified))
        .collect::<Result<Vec<_>>>()?;
    Ok(concat_batches(&unified, &conformed)?)
}

/// Splits a batch into zero-copy slices of at most `chunk_size` rows.
pub fn chunks(batch: &RecordBatch, chunk_size: usize) -> Vec<RecordBatch> {
    let size = chunk_size.max(1);
    (0..batch.num_rows())
        .step_by(size)
        .map(|offset| batch.slice(offset, size.min(batch.num_rows() - offset)))
        .collect()
}
