use anyhow::{Context, Result};
use chrono::Utc;
use pipeline_core::telemetry::init_tracing;
use pipeline_core::{Pipeline, load_config};
use tracing::{error, info};

/// Entry point for container hosts (ECS, EKS, ...) where a full run outlives
/// the Lambda timeout.
///
///     Load config from `PIPELINE_CONFIG`.
///     Run every configured dataset once, in configuration order.
///     Exit non-zero on the first failure.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config(None).context("Failed to load pipeline configuration")?;
    let pipeline = Pipeline::from_config(config).await;
    let as_of = Utc::now();

    match pipeline.run_all(as_of).await {
        Ok(reports) => {
            for report in &reports {
                info!("{}", report.summary());
            }
            info!("Finished {} datasets as of {}", reports.len(), as_of);
            Ok(())
        }
        Err(e) => {
            if e.is_retryable() {
                error!("Run failed on an unavailable store, safe to retry: {}", e);
            } else {
                error!("Run failed: {}", e);
            }
            Err(e).context("Pipeline run failed")
        }
    }
}
