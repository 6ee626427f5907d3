use arrow::datatypes::{DataType as ArrowDataType, TimeUnit};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{ConfigError, Result};
use crate::version::VersionMode;

pub const CONFIG_ENV_VAR: &str = "PIPELINE_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    pub store: StoreConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub datasets: Vec<DatasetConfig>,
    #[serde(default)]
    pub ingestion: Option<IngestionConfig>,
    #[serde(default)]
    pub promotion: Option<PromotionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub region: String,
    /// Bucket role (`raw`, `cleaned`, ...) to bucket name.
    pub buckets: BTreeMap<String, String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_update_type")]
    pub update_type: String,
    #[serde(default)]
    pub version_mode: VersionMode,
    /// Accept incoming columns the existing output does not have yet; the
    /// existing rows get nulls for them.
    #[serde(default)]
    pub allow_additive_columns: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatasetConfig {
    pub name: String,
    pub sources: Vec<SourceConfig>,
    pub columns: Vec<SchemaField>,
    #[serde(default)]
    pub comparison_key: Option<Vec<String>>,
    #[serde(default)]
    pub transform: TransformConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub bucket: String,
    pub prefix: String,
    #[serde(default)]
    pub read: ReadMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    #[default]
    LatestPartition,
    AllPartitions,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    #[default]
    Project,
    Explode {
        column: String,
        into: String,
        #[serde(default = "default_separator")]
        separator: String,
    },
    Join {
        source: SourceConfig,
        on: String,
        columns: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub bucket: String,
    pub table_name: String,
    #[serde(default = "default_file_timestamp_format")]
    pub file_timestamp_format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaField {
    pub name: String,
    pub data_type: DataType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Optional columns may be absent from the source and are filled with nulls.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Int8,
    Int16,
    Int32,
    #[serde(alias = "long", alias = "int")]
    Int64,
    Float32,
    Float64,
    #[serde(alias = "string")]
    Utf8,
    #[serde(alias = "date")]
    Date32,
    #[serde(alias = "timestamp")]
    TimestampMicrosecond,
    Decimal128 {
        precision: u8,
        scale: i8,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    pub landing_bucket: String,
    pub prefix: String,
    pub target_bucket: String,
    /// Only files below one of these path segments are ingested; empty means all.
    #[serde(default)]
    pub years: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromotionConfig {
    pub source_bucket: String,
    pub source_prefix: String,
    pub target_bucket: String,
    pub target_prefix: String,
    pub rules: Vec<SchemaField>,
}

fn default_chunk_size() -> usize {
    50_000
}

fn default_update_type() -> String {
    "insert".to_string()
}

fn default_separator() -> String {
    ",".to_string()
}

fn default_file_timestamp_format() -> String {
    "%Y%m%d".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            update_type: default_update_type(),
            version_mode: VersionMode::default(),
            allow_additive_columns: false,
        }
    }
}

impl DataType {
    pub fn to_arrow(&self) -> ArrowDataType {
        match self {
            DataType::Boolean => ArrowDataType::Boolean,
            DataType::Int8 => ArrowDataType::Int8,
            DataType::Int16 => ArrowDataType::Int16,
            DataType::Int32 => ArrowDataType::Int32,
            DataType::Int64 => ArrowDataType::Int64,
            DataType::Float32 => ArrowDataType::Float32,
            DataType::Float64 => ArrowDataType::Float64,
            DataType::Utf8 => ArrowDataType::Utf8,
            DataType::Date32 => ArrowDataType::Date32,
            DataType::TimestampMicrosecond => {
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None)
            }
            DataType::Decimal128 { precision, scale } => {
                ArrowDataType::Decimal128(*precision, *scale)
            }
        }
    }
}

pub fn load_config(config_path: Option<&str>) -> Result<PipelineConfig> {
    let config = match config_path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl PipelineConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: format!("{CONFIG_ENV_VAR} environment variable"),
        })?;
        let config: PipelineConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.datasets.is_empty() {
            return Err(invalid("At least one dataset must be configured"));
        }
        if self.processing.chunk_size == 0 {
            return Err(invalid("Chunk size must be greater than zero"));
        }
        if self.processing.update_type.is_empty() {
            return Err(invalid("Update type cannot be empty"));
        }

        let mut names = HashSet::new();
        for dataset in &self.datasets {
            if dataset.name.is_empty() {
                return Err(invalid("Dataset name cannot be empty"));
            }
            if !names.insert(dataset.name.as_str()) {
                return Err(invalid(format!("Dataset {} is declared twice", dataset.name)));
            }
            self.validate_dataset(dataset)?;
        }

        if let Some(ingestion) = &self.ingestion {
            self.store.bucket(&ingestion.landing_bucket)?;
            self.store.bucket(&ingestion.target_bucket)?;
        }
        if let Some(promotion) = &self.promotion {
            self.store.bucket(&promotion.source_bucket)?;
            self.store.bucket(&promotion.target_bucket)?;
            if promotion.source_prefix.is_empty() || promotion.target_prefix.is_empty() {
                return Err(invalid("Promotion prefixes cannot be empty"));
            }
        }
        Ok(())
    }

    fn validate_dataset(&self, dataset: &DatasetConfig) -> std::result::Result<(), ConfigError> {
        if dataset.sources.is_empty() {
            return Err(invalid(format!("Dataset {} has no sources", dataset.name)));
        }
        for source in &dataset.sources {
            self.validate_source(&dataset.name, source)?;
        }
        if dataset.columns.is_empty() {
            return Err(invalid(format!("Dataset {} has no columns", dataset.name)));
        }
        if dataset.output.table_name.is_empty() {
            return Err(invalid(format!("Dataset {} has no output table name", dataset.name)));
        }
        self.store.bucket(&dataset.output.bucket)?;
        if StrftimeItems::new(&dataset.output.file_timestamp_format).any(|i| matches!(i, Item::Error)) {
            return Err(invalid(format!(
                "Dataset {} has an invalid file_timestamp_format",
                dataset.name
            )));
        }

        let declared: HashSet<&str> = dataset.columns.iter().map(|c| c.name.as_str()).collect();
        match &dataset.transform {
            TransformConfig::Project => {}
            TransformConfig::Explode { column, into, separator } => {
                if !declared.contains(column.as_str()) {
                    return Err(invalid(format!(
                        "Dataset {} explodes undeclared column {column}",
                        dataset.name
                    )));
                }
                if declared.contains(into.as_str()) {
                    return Err(invalid(format!(
                        "Dataset {} explodes into existing column {into}",
                        dataset.name
                    )));
                }
                if separator.is_empty() {
                    return Err(invalid(format!("Dataset {} has an empty separator", dataset.name)));
                }
            }
            TransformConfig::Join { source, on, columns } => {
                self.validate_source(&dataset.name, source)?;
                if !declared.contains(on.as_str()) {
                    return Err(invalid(format!(
                        "Dataset {} joins on undeclared column {on}",
                        dataset.name
                    )));
                }
                if columns.is_empty() {
                    return Err(invalid(format!("Dataset {} joins no columns", dataset.name)));
                }
                if let Some(clash) = columns.iter().find(|c| declared.contains(c.as_str())) {
                    return Err(invalid(format!(
                        "Dataset {} joins column {clash} which it already declares",
                        dataset.name
                    )));
                }
            }
        }

        if let Some(key) = &dataset.comparison_key {
            if key.is_empty() {
                return Err(invalid(format!("Dataset {} has an empty comparison key", dataset.name)));
            }
            let output = dataset.output_columns();
            if let Some(unknown) = key.iter().find(|k| !output.contains(k)) {
                return Err(invalid(format!(
                    "Comparison key column {unknown} is not produced by dataset {}",
                    dataset.name
                )));
            }
        }
        Ok(())
    }

    fn validate_source(&self, dataset: &str, source: &SourceConfig) -> std::result::Result<(), ConfigError> {
        if source.prefix.is_empty() {
            return Err(invalid(format!("Dataset {dataset} has a source with an empty prefix")));
        }
        if !source.prefix.ends_with('/') {
            return Err(invalid(format!(
                "Source prefix {} of dataset {dataset} must end with '/'",
                source.prefix
            )));
        }
        self.store.bucket(&source.bucket)?;
        Ok(())
    }

    pub fn dataset(&self, name: &str) -> std::result::Result<&DatasetConfig, ConfigError> {
        self.datasets
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| ConfigError::UnknownDataset {
                name: name.to_string(),
            })
    }
}

impl StoreConfig {
    pub fn bucket(&self, role: &str) -> std::result::Result<&str, ConfigError> {
        self.buckets
            .get(role)
            .map(String::as_str)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConfigError::MissingField {
                field: format!("store.buckets.{role}"),
            })
    }
}

impl DatasetConfig {
    /// Names of the non-metadata columns the dataset writes, in output order.
    pub fn output_columns(&self) -> Vec<String> {
        let declared = self.columns.iter().map(|c| c.name.clone());
        match &self.transform {
            TransformConfig::Project => declared.collect(),
            TransformConfig::Explode { column, into, .. } => declared
                .filter(|c| c != column)
                .chain(std::iter::once(into.clone()))
                .collect(),
            TransformConfig::Join { columns, .. } => declared.chain(columns.iter().cloned()).collect(),
        }
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.into(),
    }
}
