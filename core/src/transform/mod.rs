//! Per-dataset layer transform: read sources, shape, merge, write.

pub mod diagnostics;
pub mod explode;
pub mod join;

use std::fmt::Write as _;
use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::codec::TabularCodec;
use crate::config::{DatasetConfig, PipelineConfig, ReadMode, SourceConfig, TransformConfig};
use crate::errors::{ConfigError, PartitionError, PipelineError, Result, SchemaError};
use crate::merge::{ComparisonKey, IncrementalMerger, MergeOutcome};
use crate::partition::{Partition, PartitionLocator, PartitionMarker, current_files};
use crate::schema;
use crate::store::ObjectStore;
use crate::telemetry::TransformReport;
use crate::version::VersionStamper;

pub struct LayerTransform<'a, S, C> {
    store: &'a S,
    codec: &'a C,
    config: &'a PipelineConfig,
}

impl<'a, S: ObjectStore, C: TabularCodec> LayerTransform<'a, S, C> {
    pub fn new(store: &'a S, codec: &'a C, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            codec,
            config,
        }
    }

    /// Runs one dataset as of `as_of` and writes the day's snapshot.
    ///
    /// Nothing is written unless every source read and every merge chunk succeeds.
    pub async fn run(&self, dataset: &DatasetConfig, as_of: DateTime<Utc>) -> Result<TransformReport> {
        let marker = PartitionMarker::for_date(&as_of);
        let output_key = output_key(dataset, &marker, &as_of, self.codec.extension())?;
        info!("Running {} into partition {}", dataset.name, marker);

        let shaped = self.load_incoming(dataset).await?;
        let incoming = schema::with_ingest_metadata(&shaped, &as_of, marker.as_str())?;
        let key = match &dataset.comparison_key {
            Some(columns) => ComparisonKey::new(columns.iter().cloned()),
            None => ComparisonKey::from_schema(&incoming.schema()),
        };

        let existing = self.read_existing(dataset).await?;
        let processing = &self.config.processing;
        let merger = IncrementalMerger::new(
            VersionStamper::new(processing.version_mode, processing.update_type.clone()),
            as_of,
        )
        .with_additive_columns(processing.allow_additive_columns);

        let mut chunks = schema::chunks(&incoming, processing.chunk_size);
        if chunks.is_empty() {
            chunks.push(incoming.clone());
        }
        let mut report = TransformReport {
            dataset: dataset.name.clone(),
            partition: marker.to_string(),
            output_key: output_key.clone(),
            rows_read: incoming.num_rows(),
            ..Default::default()
        };
        let mut merged = existing;
        for (i, chunk) in chunks.iter().enumerate() {
            let MergeOutcome {
                batch,
                stamped_rows,
                unchanged_rows,
                superseded_rows,
            } = merger.merge(chunk, &merged, &key)?;
            debug!(
                "{} chunk {}: {} stamped, {} unchanged",
                dataset.name, i, stamped_rows, unchanged_rows
            );
            report.stamped_rows += stamped_rows;
            report.unchanged_rows += unchanged_rows;
            report.superseded_rows += superseded_rows;
            merged = batch;
        }
        report.rows_written = merged.num_rows();

        let bucket = self.config.store.bucket(&dataset.output.bucket)?;
        let bytes = self.codec.encode(&merged)?;
        self.store.put(bucket, &output_key, bytes).await?;
        info!("{}", report.summary());

        diagnostics::report(&dataset.name, &merged, key.columns());
        Ok(report)
    }

    /// Source rows projected, typed and reshaped into the dataset's columns.
    pub async fn load_incoming(&self, dataset: &DatasetConfig) -> Result<RecordBatch> {
        let declared = schema::declared_schema(&dataset.columns);
        let mut projected = Vec::new();
        for source in &dataset.sources {
            for batch in self.read_source(source).await? {
                projected.push(schema::project_and_cast(&batch, &dataset.columns)?);
            }
        }
        if projected.is_empty() {
            warn!("{}: sources produced no readable files", dataset.name);
        }
        let combined = schema::concat(&declared, &projected)?;
        diagnostics::report(&format!("{} input", dataset.name), &combined, &[]);

        match &dataset.transform {
            TransformConfig::Project => Ok(combined),
            TransformConfig::Explode {
                column,
                into,
                separator,
            } => explode::explode(&combined, column, into, separator),
            TransformConfig::Join { source, on, columns } => {
                let mut wanted = vec![on.clone()];
                wanted.extend(columns.iter().cloned());
                let batches = self.read_source(source).await?;
                if batches.is_empty() {
                    return Err(PartitionError::Empty {
                        container: self.config.store.bucket(&source.bucket)?.to_string(),
                        prefix: source.prefix.clone(),
                    }
                    .into());
                }
                let right = select_columns(&batches, &wanted)?;
                join::inner_join(&combined, &right, on, columns)
            }
        }
    }

    /// Decoded files of one source, oldest partition first.
    pub async fn read_source(&self, source: &SourceConfig) -> Result<Vec<RecordBatch>> {
        let bucket = self.config.store.bucket(&source.bucket)?;
        let locator = PartitionLocator::new(self.store);

        match source.read {
            ReadMode::LatestPartition => {
                let partition = locator.latest_partition(bucket, &source.prefix).await?;
                info!("Reading {}/{}", bucket, partition.prefix);
                let batches = self.read_partition(bucket, &partition, false).await?;
                if batches.is_empty() {
                    return Err(PartitionError::Empty {
                        container: bucket.to_string(),
                        prefix: partition.prefix,
                    }
                    .into());
                }
                Ok(batches)
            }
            ReadMode::AllPartitions => {
                let partitions = locator.partitions(bucket, &source.prefix).await?;
                if partitions.is_empty() {
                    return Err(PartitionError::NotFound {
                        container: bucket.to_string(),
                        prefix: source.prefix.clone(),
                    }
                    .into());
                }
                let mut batches = Vec::new();
                for partition in &partitions {
                    batches.extend(self.read_partition(bucket, partition, true).await?);
                }
                info!(
                    "Read {} files from {} partitions under {}/{}",
                    batches.len(),
                    partitions.len(),
                    bucket,
                    source.prefix
                );
                Ok(batches)
            }
        }
    }

    async fn read_partition(
        &self,
        bucket: &str,
        partition: &Partition,
        skip_unreadable: bool,
    ) -> Result<Vec<RecordBatch>> {
        let listing = self.store.list(bucket, &partition.prefix, None).await?;
        let files: Vec<&String> = listing
            .keys
            .iter()
            .filter(|k| k.ends_with(self.codec.extension()))
            .collect();
        let keys = current_files(files.iter().copied());
        if keys.len() < files.len() {
            debug!(
                "Skipping {} superseded snapshot files in {}/{}",
                files.len() - keys.len(),
                bucket,
                partition.prefix
            );
        }

        let mut batches = Vec::new();
        for key in keys {
            match self.read_file(bucket, key).await {
                Ok(batch) => {
                    debug!("Read {} rows from {}/{}", batch.num_rows(), bucket, key);
                    batches.push(batch);
                }
                Err(e) if skip_unreadable && e.should_skip_file() => {
                    warn!("Skipping unreadable file {}/{}: {}", bucket, key, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(batches)
    }

    async fn read_file(&self, bucket: &str, key: &str) -> Result<RecordBatch> {
        let bytes = self.store.get(bucket, key).await?;
        Ok(self.codec.decode(key, bytes)?)
    }

    /// Newest file of the newest output partition, or an empty batch when
    /// there is none or it cannot be decoded. Store outages propagate.
    pub async fn read_existing(&self, dataset: &DatasetConfig) -> Result<RecordBatch> {
        match self.try_read_existing(dataset).await {
            Ok(Some(batch)) => Ok(batch),
            Ok(None) => {
                info!("{} has no existing output; starting fresh", dataset.name);
                Ok(empty_batch())
            }
            Err(e) if e.should_skip_file() => {
                warn!(
                    "Could not read existing output of {}, treating it as empty: {}",
                    dataset.name, e
                );
                Ok(empty_batch())
            }
            Err(e) => Err(e),
        }
    }

    async fn try_read_existing(&self, dataset: &DatasetConfig) -> Result<Option<RecordBatch>> {
        let bucket = self.config.store.bucket(&dataset.output.bucket)?;
        let prefix = format!("{}/", dataset.output.table_name);
        let partition = match PartitionLocator::new(self.store)
            .latest_partition(bucket, &prefix)
            .await
        {
            Ok(partition) => partition,
            Err(PipelineError::Partition(PartitionError::NotFound { .. })) => return Ok(None),
            Err(e) => return Err(e),
        };

        let listing = self.store.list(bucket, &partition.prefix, None).await?;
        let Some(key) = listing
            .keys
            .iter()
            .filter(|k| k.ends_with(self.codec.extension()))
            .max()
        else {
            return Ok(None);
        };
        info!("Existing output of {} is {}/{}", dataset.name, bucket, key);
        self.read_file(bucket, key).await.map(Some)
    }
}

/// `{table}/partitionDate={marker}/data_{as_of formatted}{extension}`.
pub fn output_key(
    dataset: &DatasetConfig,
    marker: &PartitionMarker,
    as_of: &DateTime<Utc>,
    extension: &str,
) -> Result<String> {
    let mut key = format!("{}/partitionDate={}/data_", dataset.output.table_name, marker);
    write!(key, "{}", as_of.format(&dataset.output.file_timestamp_format)).map_err(|_| {
        ConfigError::Invalid {
            message: format!(
                "file_timestamp_format {:?} of dataset {} is not a valid format",
                dataset.output.file_timestamp_format, dataset.name
            ),
        }
    })?;
    key.push_str(extension);
    Ok(key)
}

/// Keeps `names` from every batch and casts later batches to the first one's types.
fn select_columns(batches: &[RecordBatch], names: &[String]) -> Result<RecordBatch> {
    let Some(first) = batches.first() else {
        return Err(SchemaError::SchemaMismatch {
            reason: format!("no batches to select {} from", names.join(", ")),
        }
        .into());
    };
    let first_schema = first.schema();
    let mut fields = Vec::with_capacity(names.len());
    for name in names {
        let field = first_schema.field_with_name(name).map_err(|_| {
            SchemaError::MissingColumn {
                column: name.clone(),
            }
        })?;
        fields.push(field.clone().with_nullable(true));
    }
    let target = Arc::new(Schema::new(fields));

    let mut selected = Vec::with_capacity(batches.len());
    for batch in batches {
        let mut columns = Vec::with_capacity(names.len());
        for field in target.fields() {
            let column = batch.column_by_name(field.name()).ok_or_else(|| {
                SchemaError::MissingColumn {
                    column: field.name().clone(),
                }
            })?;
            columns.push(schema::cast_column(field.name(), column, field.data_type(), false)?);
        }
        selected.push(RecordBatch::try_new(target.clone(), columns)?);
    }
    schema::concat(&target, &selected)
}

fn empty_batch() -> RecordBatch {
    RecordBatch::new_empty(Arc::new(Schema::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParquetCodec;
    use crate::config::{OutputConfig, SchemaField};
    use crate::store::InMemoryObjectStore;
    use arrow::array::StringArray;
    use arrow::datatypes::{DataType, Field};
    use bytes::Bytes;
    use chrono::TimeZone;

    const CONFIG: &str = r#"
version: 1
store:
  region: us-east-1
  buckets:
    raw: raw-test-edb
    cleaned: cleaned-test-edb
datasets:
  - name: tb_silver_rate
    sources:
      - bucket: raw
        prefix: Rate/
    columns:
      - name: PlanId
        data_type: utf8
        nullable: false
      - name: Age
        data_type: utf8
    output:
      bucket: cleaned
      table_name: tb_silver_rate
      file_timestamp_format: "%Y%m%d_%H%M%S"
"#;

    fn config() -> PipelineConfig {
        serde_yaml::from_str(CONFIG).unwrap()
    }

    fn rates(plans: &[&str]) -> Bytes {
        let batch = RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("PlanId", DataType::Utf8, false),
                Field::new("Age", DataType::Utf8, true),
                Field::new("Extra", DataType::Utf8, true),
            ])),
            vec![
                Arc::new(StringArray::from(plans.to_vec())),
                Arc::new(StringArray::from(vec!["21"; plans.len()])),
                Arc::new(StringArray::from(vec!["x"; plans.len()])),
            ],
        )
        .unwrap();
        ParquetCodec.encode(&batch).unwrap()
    }

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 15, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_output_key_layout() {
        let config = config();
        let dataset = config.dataset("tb_silver_rate").unwrap();
        let key = output_key(
            dataset,
            &PartitionMarker::for_date(&as_of()),
            &as_of(),
            ".parquet",
        )
        .unwrap();
        assert_eq!(
            key,
            "tb_silver_rate/partitionDate=20240215/data_20240215_060000.parquet"
        );
    }

    #[test]
    fn test_output_key_rejects_bad_format() {
        let mut config = config();
        config.datasets[0].output = OutputConfig {
            bucket: "cleaned".to_string(),
            table_name: "tb_silver_rate".to_string(),
            file_timestamp_format: "%Q".to_string(),
        };
        let err = output_key(
            &config.datasets[0],
            &PartitionMarker::for_date(&as_of()),
            &as_of(),
            ".parquet",
        )
        .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_latest_partition_source_reads_every_file() {
        let store = InMemoryObjectStore::new();
        store.insert("raw-test-edb", "Rate/partition_date=20240101/Rate_1.parquet", rates(&["OLD"]));
        store.insert("raw-test-edb", "Rate/partition_date=20240214/Rate_1.parquet", rates(&["P1"]));
        store.insert("raw-test-edb", "Rate/partition_date=20240214/Rate_2.parquet", rates(&["P2", "P3"]));
        store.insert("raw-test-edb", "Rate/partition_date=20240214/_SUCCESS", "");
        let config = config();
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        let incoming = transform
            .load_incoming(config.dataset("tb_silver_rate").unwrap())
            .await
            .unwrap();

        assert_eq!(incoming.num_rows(), 3);
        assert_eq!(incoming.num_columns(), 2);
    }

    #[tokio::test]
    async fn test_latest_partition_source_fails_on_corrupt_file() {
        let store = InMemoryObjectStore::new();
        store.insert("raw-test-edb", "Rate/partition_date=20240214/Rate_1.parquet", "garbage");
        let config = config();
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        let err = transform
            .load_incoming(config.dataset("tb_silver_rate").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Codec(_)));
    }

    #[tokio::test]
    async fn test_all_partitions_source_skips_corrupt_file() {
        let store = InMemoryObjectStore::new();
        store.insert("raw-test-edb", "Rate/partition_date=20240101/Rate_1.parquet", rates(&["P1"]));
        store.insert("raw-test-edb", "Rate/partition_date=20240214/Rate_1.parquet", "garbage");
        store.insert("raw-test-edb", "Rate/partition_date=20240214/Rate_2.parquet", rates(&["P2"]));
        let mut config = config();
        config.datasets[0].sources[0].read = ReadMode::AllPartitions;
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        let batches = transform
            .read_source(&config.datasets[0].sources[0])
            .await
            .unwrap();
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_latest_partition_is_an_error() {
        let store = InMemoryObjectStore::new();
        store.insert("raw-test-edb", "Rate/partition_date=20240214/_SUCCESS", "");
        let config = config();
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        let err = transform
            .read_source(&config.datasets[0].sources[0])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Partition(PartitionError::Empty { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreadable_existing_output_is_empty() {
        let store = InMemoryObjectStore::new();
        store.insert(
            "cleaned-test-edb",
            "tb_silver_rate/partitionDate=20240214/data_20240214_060000.parquet",
            "garbage",
        );
        let config = config();
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        let existing = transform.read_existing(&config.datasets[0]).await.unwrap();
        assert_eq!(existing.num_rows(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_existing_output_is_an_error() {
        let store = InMemoryObjectStore::new();
        store.insert(
            "cleaned-test-edb",
            "tb_silver_rate/partitionDate=20240214/data_20240214_060000.parquet",
            rates(&["P1"]),
        );
        let config = config();
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        store.fail_operation_on("get", "cleaned-test-edb");
        let err = transform.read_existing(&config.datasets[0]).await.unwrap_err();
        assert!(err.is_retryable());

        store.restore_operation_on("get", "cleaned-test-edb");
        store.fail_operation_on("list", "cleaned-test-edb");
        let err = transform.read_existing(&config.datasets[0]).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_snapshot_partition_reads_newest_file_only() {
        let store = InMemoryObjectStore::new();
        store.insert(
            "cleaned-test-edb",
            "tb_silver_rate/partitionDate=20240215/data_20240215_060000.parquet",
            rates(&["P1"]),
        );
        store.insert(
            "cleaned-test-edb",
            "tb_silver_rate/partitionDate=20240215/data_20240215_180000.parquet",
            rates(&["P1", "P2"]),
        );
        let config = config();
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);
        let source: SourceConfig =
            serde_yaml::from_str("{ bucket: cleaned, prefix: tb_silver_rate/ }").unwrap();

        let batches = transform.read_source(&source).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 2);

        let source: SourceConfig = serde_yaml::from_str(
            "{ bucket: cleaned, prefix: tb_silver_rate/, read: all_partitions }",
        )
        .unwrap();
        let batches = transform.read_source(&source).await.unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_column_fails_run() {
        let store = InMemoryObjectStore::new();
        store.insert("raw-test-edb", "Rate/partition_date=20240214/Rate_1.parquet", rates(&["P1"]));
        let mut config = config();
        config.datasets[0].columns.push(SchemaField {
            name: "IssuerId".to_string(),
            data_type: crate::config::DataType::Int64,
            nullable: true,
            optional: false,
        });
        let transform = LayerTransform::new(&store, &ParquetCodec, &config);

        let err = transform.run(&config.datasets[0], as_of()).await.unwrap_err();
        assert!(err.to_string().contains("IssuerId"));
        assert!(store.keys("cleaned-test-edb").is_empty());
    }

    #[test]
    fn test_select_columns_casts_to_first_batch() {
        let first = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("ServiceAreaId", DataType::Utf8, false)])),
            vec![Arc::new(StringArray::from(vec!["A1"]))],
        )
        .unwrap();
        let second = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("ServiceAreaId", DataType::Int64, true)])),
            vec![Arc::new(arrow::array::Int64Array::from(vec![7]))],
        )
        .unwrap();

        let selected = select_columns(&[first, second], &["ServiceAreaId".to_string()]).unwrap();
        assert_eq!(selected.num_rows(), 2);
        assert_eq!(selected.schema().field(0).data_type(), &DataType::Utf8);
    }
}
