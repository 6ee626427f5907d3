pub mod codec;
pub mod config;
pub mod errors;
pub mod ingest;
pub mod merge;
pub mod partition;
pub mod pipeline;
pub mod promote;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod transform;
pub mod version;

pub use codec::{ParquetCodec, TabularCodec};
pub use config::{PipelineConfig, load_config};
pub use errors::{PipelineError, Result};
pub use merge::{ComparisonKey, IncrementalMerger, MergeOutcome};
pub use partition::{Partition, PartitionLocator, PartitionMarker};
pub use pipeline::{Pipeline, Stage};
pub use store::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
pub use version::{VersionMode, VersionStamper};
