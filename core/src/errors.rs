use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Partition error: {0}")]
    Partition(#[from] PartitionError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Unknown dataset: {name}")]
    UnknownDataset { name: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object {container}/{key} not found")]
    NotFound { container: String, key: String },

    #[error("Object store unavailable during {operation}: {reason}")]
    Unavailable { operation: String, reason: String },
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("No partition found under {container}/{prefix}")]
    NotFound { container: String, prefix: String },

    #[error("Partition {container}/{prefix} holds no data files")]
    Empty { container: String, prefix: String },
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Column {column} is missing")]
    MissingColumn { column: String },

    #[error("Column {column} has type {found}, expected {expected}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Schema mismatch: {reason}")]
    SchemaMismatch { reason: String },

    #[error("Failed to cast column {column}: {reason}")]
    Cast { column: String, reason: String },
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode batch: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode {key}: {reason}")]
    Decode { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("No dialect could parse {key}")]
    UnparsableInput { key: String },

    #[error("Landing object {key} is not valid CSV: {reason}")]
    Malformed { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

impl PipelineError {
    /// Store outages are left to the trigger runtime to retry; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Store(StoreError::Unavailable { .. }))
    }

    /// Whether a multi-file scan may log this error and continue with the next file.
    pub fn should_skip_file(&self) -> bool {
        match self {
            PipelineError::Codec(_) => true,
            PipelineError::Ingestion(_) => true,
            PipelineError::Store(StoreError::NotFound { .. }) => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Config(_) => 400,
            PipelineError::Serialization(SerializationError::Yaml { .. }) => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_is_retryable() {
        let err = PipelineError::Store(StoreError::Unavailable {
            operation: "list".to_string(),
            reason: "connection reset".to_string(),
        });
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_partition_not_found_is_fatal() {
        let err = PipelineError::from(PartitionError::NotFound {
            container: "raw".to_string(),
            prefix: "Rate/".to_string(),
        });
        assert!(!err.is_retryable());
        assert!(!err.should_skip_file());
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("raw/Rate/"));
    }

    #[test]
    fn test_config_errors_map_to_bad_request() {
        let err = PipelineError::from(ConfigError::UnknownDataset {
            name: "tb_missing".to_string(),
        });
        assert_eq!(err.status_code(), 400);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_codec_errors_are_skippable_in_scans() {
        let err = PipelineError::from(CodecError::Decode {
            key: "tb_silver_rate/data.parquet".to_string(),
            reason: "bad magic".to_string(),
        });
        assert!(err.should_skip_file());

        let schema = PipelineError::from(SchemaError::SchemaMismatch {
            reason: "drift".to_string(),
        });
        assert!(!schema.should_skip_file());
    }

    #[test]
    fn test_yaml_error_conversion() {
        let parsed: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str("a: [1");
        let err = PipelineError::from(parsed.unwrap_err());
        assert!(matches!(
            err,
            PipelineError::Serialization(SerializationError::Yaml { .. })
        ));
        assert_eq!(err.status_code(), 400);
    }
}
