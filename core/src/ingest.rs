//! Landing CSV files into the raw layer.
//!
//! Each file goes through an ordered dialect probe. The first candidate that
//! yields more than one column wins. If none does, the header line is read as
//! an all-text schema.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::concat_batches;
use arrow::csv::ReaderBuilder;
use arrow::csv::reader::Format;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::codec::TabularCodec;
use crate::config::{IngestionConfig, PipelineConfig};
use crate::errors::{ConfigError, IngestionError, Result};
use crate::partition::PartitionMarker;
use crate::schema::{self, VERSION_COLUMN};
use crate::store::ObjectStore;
use crate::telemetry::IngestReport;
use crate::transform::diagnostics;
use crate::version::VersionStamper;

/// Rows sampled for type inference.
const INFER_RECORDS: usize = 1_000;

const BATCH_ROWS: usize = 8_192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub name: &'static str,
    pub delimiter: u8,
    pub encoding: Encoding,
}

pub const DIALECTS: [Dialect; 4] = [
    Dialect {
        name: "comma",
        delimiter: b',',
        encoding: Encoding::Utf8,
    },
    Dialect {
        name: "tab",
        delimiter: b'\t',
        encoding: Encoding::Utf8,
    },
    Dialect {
        name: "semicolon",
        delimiter: b';',
        encoding: Encoding::Utf8,
    },
    Dialect {
        name: "comma latin-1",
        delimiter: b',',
        encoding: Encoding::Latin1,
    },
];

impl Dialect {
    pub fn parse(&self, bytes: &[u8]) -> std::result::Result<RecordBatch, ArrowError> {
        let text = match self.encoding {
            Encoding::Utf8 => bytes.to_vec(),
            Encoding::Latin1 => latin1_to_utf8(bytes).into_bytes(),
        };
        let format = Format::default()
            .with_header(true)
            .with_delimiter(self.delimiter);
        let (schema, _) = format.infer_schema(Cursor::new(&text), Some(INFER_RECORDS))?;
        if schema.fields().len() < 2 {
            return Err(ArrowError::CsvError(format!(
                "{} dialect found {} column(s)",
                self.name,
                schema.fields().len()
            )));
        }
        read_all(Arc::new(schema), self.delimiter, &text)
    }
}

/// Parses `bytes` with the first dialect that fits, falling back to an all-text read.
pub fn parse_csv(key: &str, bytes: &[u8]) -> std::result::Result<RecordBatch, IngestionError> {
    for dialect in &DIALECTS {
        match dialect.parse(bytes) {
            Ok(batch) => {
                debug!("Parsed {} with the {} dialect", key, dialect.name);
                return Ok(batch);
            }
            Err(e) => warn!("Could not read {} as {}: {}", key, dialect.name, e),
        }
    }

    info!("Inferring an all-text schema for {} from its header", key);
    read_with_text_header(bytes).map_err(|e| {
        warn!("Header fallback failed for {}: {}", key, e);
        IngestionError::UnparsableInput {
            key: key.to_string(),
        }
    })
}

fn read_with_text_header(bytes: &[u8]) -> std::result::Result<RecordBatch, ArrowError> {
    let text = String::from_utf8_lossy(bytes);
    let header = text
        .lines()
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or_else(|| ArrowError::CsvError("missing header line".to_string()))?;
    let fields: Vec<Field> = header
        .split(',')
        .map(|name| Field::new(name.trim().trim_matches('"'), DataType::Utf8, true))
        .collect();
    read_all(Arc::new(Schema::new(fields)), b',', text.as_bytes())
}

fn read_all(schema: SchemaRef, delimiter: u8, text: &[u8]) -> std::result::Result<RecordBatch, ArrowError> {
    let reader = ReaderBuilder::new(schema.clone())
        .with_header(true)
        .with_delimiter(delimiter)
        .with_batch_size(BATCH_ROWS)
        .build(Cursor::new(text))?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    concat_batches(&schema, &batches)
}

fn latin1_to_utf8(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// `Rate_PUF_2015.csv` becomes `Rate`.
pub fn table_name(key: &str) -> Option<String> {
    let file = key.rsplit('/').next()?;
    let stem = match file.find("_PUF") {
        Some(i) => &file[..i],
        None => file.rsplit_once('.').map_or(file, |(stem, _)| stem),
    };
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Whether a landing key is a visible CSV file below one of `years`.
pub fn is_landing_file(key: &str, prefix: &str, years: &[String]) -> bool {
    let Some(relative) = key.strip_prefix(prefix) else {
        return false;
    };
    let mut segments: Vec<&str> = relative.split('/').collect();
    let Some(file) = segments.pop() else {
        return false;
    };
    if file.starts_with('.') || !file.to_ascii_lowercase().ends_with(".csv") {
        return false;
    }
    years.is_empty() || segments.iter().any(|s| years.iter().any(|y| y == s))
}

pub struct RawIngestor<'a, S, C> {
    store: &'a S,
    codec: &'a C,
    config: &'a PipelineConfig,
}

impl<'a, S: ObjectStore, C: TabularCodec> RawIngestor<'a, S, C> {
    pub fn new(store: &'a S, codec: &'a C, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            codec,
            config,
        }
    }

    fn ingestion(&self) -> std::result::Result<&'a IngestionConfig, ConfigError> {
        self.config
            .ingestion
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField {
                field: "ingestion".to_string(),
            })
    }

    /// Ingests every landing CSV. Files that fail are logged and skipped, except
    /// when the store itself is unavailable.
    pub async fn ingest(&self, as_of: DateTime<Utc>) -> Result<IngestReport> {
        let ingestion = self.ingestion()?;
        let landing = self.config.store.bucket(&ingestion.landing_bucket)?;
        let listing = self.store.list(landing, &ingestion.prefix, None).await?;

        let mut report = IngestReport::default();
        for key in listing
            .keys
            .iter()
            .filter(|k| is_landing_file(k, &ingestion.prefix, &ingestion.years))
        {
            report.files_seen += 1;
            match self.ingest_file(key, &as_of).await {
                Ok((rows, keys)) => {
                    report.files_ingested += 1;
                    report.rows_written += rows;
                    report.keys_written.extend(keys);
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("Skipping landing file {}/{}: {}", landing, key, e);
                    report.files_skipped += 1;
                }
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Writes one landing file as chunked raw parquet; returns rows and keys written.
    pub async fn ingest_file(&self, key: &str, as_of: &DateTime<Utc>) -> Result<(usize, Vec<String>)> {
        let ingestion = self.ingestion()?;
        let landing = self.config.store.bucket(&ingestion.landing_bucket)?;
        let target = self.config.store.bucket(&ingestion.target_bucket)?;
        let table = table_name(key).ok_or_else(|| IngestionError::Malformed {
            key: key.to_string(),
            reason: "no table name in key".to_string(),
        })?;

        let bytes = self.store.get(landing, key).await?;
        let parsed = parse_csv(key, &bytes)?;
        info!("Parsed {} rows of {} from {}", parsed.num_rows(), table, key);

        let marker = PartitionMarker::for_date(as_of);
        let stamper = VersionStamper::new(
            self.config.processing.version_mode,
            self.config.processing.update_type.clone(),
        );
        let mut written = Vec::new();
        for (n, chunk) in schema::chunks(&parsed, self.config.processing.chunk_size)
            .iter()
            .enumerate()
        {
            let chunk = schema::with_ingest_metadata(chunk, as_of, marker.as_str())?;
            let versions: ArrayRef = Arc::new(stamper.stamp_batch(&chunk, as_of)?);
            let chunk = schema::set_column(&chunk, VERSION_COLUMN, versions)?;

            diagnostics::report(&table, &chunk, &[]);
            let out = format!(
                "{table}/partition_date={marker}/{table}_{}{}",
                n + 1,
                self.codec.extension()
            );
            self.store.put(target, &out, self.codec.encode(&chunk)?).await?;
            info!("Wrote {} rows to {}/{}", chunk.num_rows(), target, out);
            written.push(out);
        }
        Ok((parsed.num_rows(), written))
    }
}
