use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::codec::{ParquetCodec, TabularCodec};
use crate::config::PipelineConfig;
use crate::errors::Result;
use crate::ingest::RawIngestor;
use crate::promote::GoldPromotion;
use crate::store::{ObjectStore, S3ObjectStore};
use crate::telemetry::{IngestReport, PromotionReport, TransformReport};
use crate::transform::LayerTransform;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// landing CSV -> raw parquet
    Ingest,
    /// raw -> cleaned/silver
    #[default]
    Transform,
    /// silver -> delivery/gold
    Promote,
}

/// The pipeline wires the configuration to its store and codec and runs stages.
pub struct Pipeline<S, C = ParquetCodec> {
    config: PipelineConfig,
    store: S,
    codec: C,
}

impl Pipeline<S3ObjectStore, ParquetCodec> {
    pub async fn from_config(config: PipelineConfig) -> Self {
        let store = S3ObjectStore::new(&config.store).await;
        Self::new(config, store, ParquetCodec)
    }
}

impl<S: ObjectStore, C: TabularCodec> Pipeline<S, C> {
    pub fn new(config: PipelineConfig, store: S, codec: C) -> Self {
        Self {
            config,
            store,
            codec,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn run_dataset(&self, name: &str, as_of: DateTime<Utc>) -> Result<TransformReport> {
        let dataset = self.config.dataset(name)?;
        LayerTransform::new(&self.store, &self.codec, &self.config)
            .run(dataset, as_of)
            .await
    }

    /// Runs every dataset in configuration order, stopping at the first failure.
    pub async fn run_all(&self, as_of: DateTime<Utc>) -> Result<Vec<TransformReport>> {
        let transform = LayerTransform::new(&self.store, &self.codec, &self.config);
        let mut reports = Vec::with_capacity(self.config.datasets.len());
        for dataset in &self.config.datasets {
            reports.push(transform.run(dataset, as_of).await?);
        }
        Ok(reports)
    }

    pub async fn ingest_raw(&self, as_of: DateTime<Utc>) -> Result<IngestReport> {
        RawIngestor::new(&self.store, &self.codec, &self.config)
            .ingest(as_of)
            .await
    }

    pub async fn promote(&self) -> Result<PromotionReport> {
        GoldPromotion::new(&self.store, &self.codec, &self.config)
            .promote()
            .await
    }

    /// Runs one stage and returns a human readable summary.
    ///
    /// A transform without a dataset name runs every dataset.
    pub async fn run_stage(
        &self,
        stage: Stage,
        dataset: Option<&str>,
        as_of: DateTime<Utc>,
    ) -> Result<String> {
        info!("Running stage {:?} as of {}", stage, as_of);
        match (stage, dataset) {
            (Stage::Transform, Some(name)) => Ok(self.run_dataset(name, as_of).await?.summary()),
            (Stage::Transform, None) => Ok(self
                .run_all(as_of)
                .await?
                .iter()
                .map(TransformReport::summary)
                .collect::<Vec<_>>()
                .join("\n")),
            (Stage::Ingest, _) => Ok(self.ingest_raw(as_of).await?.summary()),
            (Stage::Promote, _) => Ok(self.promote().await?.summary()),
        }
    }
}
