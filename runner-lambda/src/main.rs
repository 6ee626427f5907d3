use std::error::Error as _;

use chrono::{DateTime, Utc};
use lambda_runtime::{Error, LambdaEvent, service_fn};
use pipeline_core::codec::TabularCodec;
use pipeline_core::store::ObjectStore;
use pipeline_core::telemetry::init_tracing;
use pipeline_core::{Pipeline, PipelineError, Stage, load_config};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Default, Deserialize)]
struct TriggerRequest {
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Falls back to the `PIPELINE_CONFIG` environment variable.
    #[serde(default)]
    pub config_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl TriggerResponse {
    fn ok(body: String) -> Self {
        Self {
            status_code: 200,
            body,
        }
    }

    fn failed(err: &PipelineError) -> Self {
        let mut errors = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            errors.push(cause.to_string());
            source = cause.source();
        }
        Self {
            status_code: err.status_code(),
            body: serde_json::to_string(&errors).unwrap_or_else(|_| format!("[{:?}]", err.to_string())),
        }
    }
}

async fn run<S: ObjectStore, C: TabularCodec>(
    pipeline: &Pipeline<S, C>,
    request: &TriggerRequest,
    as_of: DateTime<Utc>,
) -> TriggerResponse {
    match pipeline
        .run_stage(request.stage, request.dataset.as_deref(), as_of)
        .await
    {
        Ok(summary) => {
            info!("{}", summary);
            TriggerResponse::ok(summary)
        }
        Err(e) => {
            error!("Stage {:?} failed: {}", request.stage, e);
            TriggerResponse::failed(&e)
        }
    }
}

async fn lambda_handler(event: LambdaEvent<TriggerRequest>) -> Result<TriggerResponse, Error> {
    let request = event.payload;
    info!("Received trigger {:?} ({})", request, event.context.request_id);

    let config = match load_config(request.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Could not load configuration: {}", e);
            return Ok(TriggerResponse::failed(&e));
        }
    };
    let pipeline = Pipeline::from_config(config).await;
    Ok(run(&pipeline, &request, Utc::now()).await)
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();
    lambda_runtime::run(service_fn(lambda_handler)).await
}
