use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use saas_etl::app::run_from_config;
use saas_etl::config::{lambda::LambdaConfig, EtlConfig};
use saas_etl::utils::{logger, validation::Validate};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct Request {
    pub config_path: Option<String>,
    pub pipelines: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct PipelineOutcome {
    pub pipeline: String,
    pub records_loaded: usize,
    pub duplicates_removed: u64,
}

#[derive(Serialize)]
pub struct Response {
    pub message: String,
    pub pipelines: Vec<PipelineOutcome>,
    pub failures: Vec<String>,
}

async fn function_handler(event: LambdaEvent<Request>) -> Result<Response, Error> {
    tracing::info!("Starting ETL Lambda function");

    let lambda_config = LambdaConfig::resolve(event.payload.config_path, event.payload.pipelines)?;
    lambda_config.validate()?;

    let config = EtlConfig::from_file(&lambda_config.config_path)?;
    config.validate()?;

    let summary = run_from_config(&config, &lambda_config.pipelines, false).await?;
    let failures: Vec<String> = summary.failures.iter().map(|f| f.to_string()).collect();

    // 任何 pipeline 失敗都讓這次呼叫失敗，交給 Lambda 的重試/告警
    if !failures.is_empty() {
        tracing::error!("❌ {} pipeline(s) failed", failures.len());
        return Err(failures.join("; ").into());
    }

    let pipelines = summary
        .reports
        .iter()
        .map(|report| PipelineOutcome {
            pipeline: report.pipeline.clone(),
            records_loaded: report.records_loaded(),
            duplicates_removed: report.duplicates_removed,
        })
        .collect();

    tracing::info!("ETL Lambda function completed successfully");
    Ok(Response {
        message: "ETL process completed successfully".to_string(),
        pipelines,
        failures,
    })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    logger::init_lambda_logger();
    run(service_fn(function_handler)).await
}
