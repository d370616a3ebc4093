use crate::core::extract::WindowedExtractor;
use crate::core::load::Loader;
use crate::core::lock;
use crate::core::stage::{staging_key, Stager};
use crate::core::watermark::WatermarkReader;
use crate::domain::model::{
    Category, CategoryReport, LoadPolicy, PipelineSpec, RunReport, RunStamp,
};
use crate::domain::ports::{ObjectStore, SourceApi, Warehouse};
use crate::utils::error::{RunFailure, Stage};
use crate::utils::monitor::SystemMonitor;
use chrono::{Duration, NaiveDateTime};
use std::path::PathBuf;
use tracing::Instrument;

/// Run-wide settings that do not belong to a single pipeline.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub staging_dir: PathBuf,
    /// Window start for a category that has never been loaded.
    pub initial_backfill_start: NaiveDateTime,
    pub lease: Duration,
}

pub struct EtlEngine<S: ObjectStore, W: Warehouse> {
    store: S,
    warehouse: W,
    settings: EngineSettings,
    monitor: SystemMonitor,
}

type RunResult = std::result::Result<RunReport, RunFailure>;

impl<S: ObjectStore, W: Warehouse> EtlEngine<S, W> {
    pub fn new(store: S, warehouse: W, settings: EngineSettings) -> Self {
        Self::new_with_monitoring(store, warehouse, settings, false)
    }

    pub fn new_with_monitoring(
        store: S,
        warehouse: W,
        settings: EngineSettings,
        monitor_enabled: bool,
    ) -> Self {
        Self {
            store,
            warehouse,
            settings,
            monitor: SystemMonitor::new(monitor_enabled),
        }
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    pub async fn run(&self, spec: &PipelineSpec, source: &dyn SourceApi) -> RunResult {
        self.run_at(spec, source, RunStamp::now()).await
    }

    /// 以指定的執行時間跑一次：取鎖 → 各分類 watermark/extract/stage/load → 去重 → 釋放鎖
    pub async fn run_at(
        &self,
        spec: &PipelineSpec,
        source: &dyn SourceApi,
        run: RunStamp,
    ) -> RunResult {
        let span = tracing::info_span!("pipeline", pipeline = %spec.name);
        async {
            tracing::info!("🚀 Starting run at {}", run.etl_tstamp());

            let lease = lock::lease_for(
                &spec.name,
                &lock::holder_id(),
                run.started_at,
                self.settings.lease,
            );
            lock::acquire(&self.warehouse, &lease)
                .await
                .map_err(|e| RunFailure::new(&spec.name, "-", Stage::Lock, e))?;

            let result = self.run_locked(spec, source, &run).await;

            // 成功或失敗都要釋放
            lock::release(&self.warehouse, &lease).await;

            match &result {
                Ok(report) => tracing::info!(
                    records = report.records_loaded(),
                    duplicates_removed = report.duplicates_removed,
                    "✅ Run finished"
                ),
                Err(failure) => tracing::error!(
                    category = %failure.category,
                    stage = %failure.stage,
                    cause = %failure.cause,
                    "❌ Run failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_locked(
        &self,
        spec: &PipelineSpec,
        source: &dyn SourceApi,
        run: &RunStamp,
    ) -> RunResult {
        let mut report = RunReport {
            pipeline: spec.name.clone(),
            categories: Vec::with_capacity(spec.categories.len()),
            duplicates_removed: 0,
        };

        for category in &spec.categories {
            let category_report = self
                .run_category(spec, source, category, run)
                .instrument(tracing::info_span!("category", category = %category))
                .await?;
            report.categories.push(category_report);
        }

        if spec.deduplicate && spec.policy == LoadPolicy::Incremental {
            report.duplicates_removed = Loader::new(&self.warehouse)
                .remove_duplicates(&spec.target)
                .await
                .map_err(|e| RunFailure::new(&spec.name, "all", Stage::Deduplicate, e))?;
            self.monitor.log_stage(&spec.name, "all", "deduplicate");
        }

        Ok(report)
    }

    async fn run_category(
        &self,
        spec: &PipelineSpec,
        source: &dyn SourceApi,
        category: &Category,
        run: &RunStamp,
    ) -> std::result::Result<CategoryReport, RunFailure> {
        let fail = |stage: Stage| {
            let pipeline = spec.name.clone();
            let label = category.label().to_string();
            move |e| RunFailure::new(&pipeline, &label, stage, e)
        };

        let window = WatermarkReader::new(&self.warehouse, self.settings.initial_backfill_start)
            .window_for(spec.policy, &spec.target, category, run)
            .await
            .map_err(fail(Stage::Watermark))?;

        let mut category_report = CategoryReport {
            category: category.clone(),
            window,
            records: 0,
            staged_key: None,
        };

        if window.is_empty() {
            tracing::info!("Window {} is empty, nothing to extract", window);
            return Ok(category_report);
        }

        let batch = WindowedExtractor::new(source)
            .extract(&window, category, run)
            .await
            .map_err(fail(Stage::Extract))?;
        self.monitor.log_stage(&spec.name, category.label(), "extract");
        category_report.records = batch.records.len();

        if batch.records.is_empty() {
            // 全量刷新時空批次也不載入，避免把表清空
            tracing::info!("No new records in {}", window);
            return Ok(category_report);
        }

        let key = staging_key(&spec.key_prefix, &spec.name, category, run, spec.copy.format);
        let staged = Stager::new(&self.store, &self.settings.staging_dir)
            .stage(&batch, &key, spec.copy.format, spec.columns.as_deref())
            .await
            .map_err(fail(Stage::Stage))?;
        self.monitor.log_stage(&spec.name, category.label(), "stage");

        Loader::new(&self.warehouse)
            .load(spec.policy, &spec.target, &staged, &spec.copy)
            .await
            .map_err(fail(Stage::Load))?;
        self.monitor.log_stage(&spec.name, category.label(), "load");

        category_report.staged_key = Some(staged.key);
        Ok(category_report)
    }
}
