use crate::adapters::{build_source, RedshiftWarehouse, S3Storage};
use crate::config::toml_config::EtlConfig;
use crate::core::etl::EtlEngine;
use crate::domain::model::RunReport;
use crate::domain::ports::{ObjectStore, Warehouse};
use crate::utils::error::{ErrorSeverity, Result, RunFailure, Stage};

/// Outcome of one invocation over the selected pipelines.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub reports: Vec<RunReport>,
    pub failures: Vec<RunFailure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Exit code of the most severe failure; 0 when everything ran.
    pub fn exit_code(&self) -> i32 {
        self.failures
            .iter()
            .max_by_key(|f| f.cause.severity())
            .map(RunFailure::exit_code)
            .unwrap_or(0)
    }

    pub fn worst_severity(&self) -> Option<ErrorSeverity> {
        self.failures.iter().map(|f| f.cause.severity()).max()
    }
}

/// 依序執行選定的 pipelines；單一 pipeline 失敗不影響後面的
pub async fn run_pipelines<S: ObjectStore, W: Warehouse>(
    engine: &EtlEngine<S, W>,
    config: &EtlConfig,
    names: &[String],
) -> Result<RunSummary> {
    let selected = config.selected_pipelines(names)?;
    let mut summary = RunSummary::default();

    for pipeline in selected {
        let spec = config.spec_for(pipeline);
        let source = match build_source(pipeline) {
            Ok(source) => source,
            Err(e) => {
                summary
                    .failures
                    .push(RunFailure::new(&pipeline.name, "-", Stage::Extract, e));
                continue;
            }
        };

        match engine.run(&spec, source.as_ref()).await {
            Ok(report) => summary.reports.push(report),
            Err(failure) => summary.failures.push(failure),
        }
    }

    Ok(summary)
}

/// 建立 S3 與 Redshift 連線後執行；連線池在任何結果下都會關閉
pub async fn run_from_config(
    config: &EtlConfig,
    names: &[String],
    monitor_enabled: bool,
) -> Result<RunSummary> {
    let settings = config.engine_settings()?;
    let store = S3Storage::from_config(&config.object_store).await;
    let warehouse = RedshiftWarehouse::connect(&config.warehouse, &config.run.lock_table).await?;

    let engine = EtlEngine::new_with_monitoring(store, warehouse, settings, monitor_enabled);
    let result = run_pipelines(&engine, config, names).await;
    engine.warehouse().close().await;
    result
}
