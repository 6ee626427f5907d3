//! Validated copy of silver files into the delivery (gold) layer.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use tracing::{info, warn};

use crate::codec::TabularCodec;
use crate::config::{PipelineConfig, PromotionConfig, SchemaField};
use crate::errors::{ConfigError, Result};
use crate::partition::current_files;
use crate::schema;
use crate::store::ObjectStore;
use crate::telemetry::PromotionReport;

/// `key=value` path segments of an object key, in order.
pub fn partition_values(key: &str) -> Vec<(&str, &str)> {
    key.split('/')
        .filter_map(|segment| segment.split_once('='))
        .filter(|(name, value)| {
            !name.is_empty()
                && !value.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        .collect()
}

/// Adds each partition segment of `key` as a text column unless the batch has it.
pub fn with_partition_columns(batch: &RecordBatch, key: &str) -> Result<RecordBatch> {
    let mut batch = batch.clone();
    for (name, value) in partition_values(key) {
        if batch.column_by_name(name).is_none() {
            let column: ArrayRef = Arc::new(StringArray::from(vec![value; batch.num_rows()]));
            batch = schema::set_column(&batch, name, column)?;
        }
    }
    Ok(batch)
}

/// Coerces the ruled columns and checks them. Returns the coerced batch, or
/// every violation found.
pub fn validate(batch: &RecordBatch, rules: &[SchemaField]) -> std::result::Result<RecordBatch, Vec<String>> {
    let mut coerced = batch.clone();
    let mut violations = Vec::new();

    for rule in rules {
        let Some(column) = batch.column_by_name(&rule.name) else {
            if !rule.optional {
                violations.push(format!("required column {} is missing", rule.name));
            }
            continue;
        };

        let cast = match schema::cast_column(&rule.name, column, &rule.data_type.to_arrow(), true) {
            Ok(cast) => cast,
            Err(e) => {
                violations.push(e.to_string());
                continue;
            }
        };
        if !rule.nullable && cast.null_count() > 0 {
            violations.push(format!(
                "column {} has {} null or invalid values",
                rule.name,
                cast.null_count()
            ));
        }
        match schema::set_column(&coerced, &rule.name, cast) {
            Ok(updated) => coerced = updated,
            Err(e) => violations.push(e.to_string()),
        }
    }

    if violations.is_empty() {
        Ok(coerced)
    } else {
        Err(violations)
    }
}

pub struct GoldPromotion<'a, S, C> {
    store: &'a S,
    codec: &'a C,
    config: &'a PipelineConfig,
}

impl<'a, S: ObjectStore, C: TabularCodec> GoldPromotion<'a, S, C> {
    pub fn new(store: &'a S, codec: &'a C, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            codec,
            config,
        }
    }

    pub async fn promote(&self) -> Result<PromotionReport> {
        let promotion = self
            .config
            .promotion
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField {
                field: "promotion".to_string(),
            })?;
        let source = self.config.store.bucket(&promotion.source_bucket)?;
        let target = self.config.store.bucket(&promotion.target_bucket)?;

        let listing = self.store.list(source, &promotion.source_prefix, None).await?;
        let keys = current_files(
            listing
                .keys
                .iter()
                .filter(|k| k.ends_with(self.codec.extension())),
        );
        info!("Found {} silver files under {}/{}", keys.len(), source, promotion.source_prefix);

        let mut report = PromotionReport::default();
        for key in keys {
            report.examined += 1;
            let batch = match self.read(source, key).await {
                Ok(batch) => batch,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!("Could not read {}/{}: {}", source, key, e);
                    report.unreadable += 1;
                    continue;
                }
            };
            info!("Loaded {} rows from {}", batch.num_rows(), key);

            match self.prepare(&batch, key, &promotion.rules) {
                Ok(body) => {
                    let gold_key = gold_key(promotion, key);
                    self.store.put(target, &gold_key, body).await?;
                    info!("Promoted {} to {}/{}", key, target, gold_key);
                    report.promoted += 1;
                }
                Err(violations) => {
                    warn!("{} failed validation, not promoted: {}", key, violations.join("; "));
                    report.rejected += 1;
                }
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Gold body of one silver file. Every failure here rejects only that file.
    fn prepare(
        &self,
        batch: &RecordBatch,
        key: &str,
        rules: &[SchemaField],
    ) -> std::result::Result<Bytes, Vec<String>> {
        let batch = with_partition_columns(batch, key).map_err(|e| vec![e.to_string()])?;
        let valid = validate(&batch, rules)?;
        self.codec.encode(&valid).map_err(|e| vec![e.to_string()])
    }

    async fn read(&self, bucket: &str, key: &str) -> Result<RecordBatch> {
        let bytes = self.store.get(bucket, key).await?;
        Ok(self.codec.decode(key, bytes)?)
    }
}

fn gold_key(promotion: &PromotionConfig, key: &str) -> String {
    match key.strip_prefix(&promotion.source_prefix) {
        Some(rest) => format!("{}{}", promotion.target_prefix, rest),
        None => key.to_string(),
    }
}
