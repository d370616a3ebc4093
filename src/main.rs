use clap::Parser;
use saas_etl::app::{plan, run_from_config};
use saas_etl::config::EtlConfig;
use saas_etl::domain::model::RunStamp;
use saas_etl::utils::{logger, validation::Validate};
use saas_etl::CliConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliConfig::parse();

    // 初始化日誌
    logger::init_cli_logger(args.verbose);

    tracing::info!("🚀 Starting saas-etl");
    tracing::info!("📁 Loading configuration from: {}", args.config);

    let config = match EtlConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load config file '{}': {}", args.config, e);
            eprintln!("💡 Make sure the file exists, is valid TOML and every ${{VAR}} is exported");
            std::process::exit(3);
        }
    };

    // 驗證配置
    if let Err(e) = args.validate().and_then(|_| config.validate()) {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(3);
    }

    tracing::info!("✅ Configuration loaded and validated successfully");

    if args.dry_run {
        tracing::info!("🔍 DRY RUN MODE - No actual processing will occur");
        for pipeline in plan(&config, &args.pipelines, &RunStamp::now())? {
            println!("{}", pipeline);
        }
        return Ok(());
    }

    if args.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    let summary = match run_from_config(&config, &args.pipelines, args.monitor).await {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(
                "❌ ETL setup failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());
            std::process::exit(1);
        }
    };

    for report in &summary.reports {
        println!(
            "✅ {}: {} records loaded, {} duplicates removed",
            report.pipeline,
            report.records_loaded(),
            report.duplicates_removed
        );
    }

    for failure in &summary.failures {
        // 記錄詳細錯誤信息
        tracing::error!(
            pipeline = %failure.pipeline,
            category = %failure.category,
            stage = %failure.stage,
            "❌ {} (Category: {:?}, Severity: {:?})",
            failure.cause,
            failure.cause.category(),
            failure.cause.severity()
        );
        eprintln!("❌ {}: {}", failure.pipeline, failure.cause.user_friendly_message());
        eprintln!("💡 建議: {}", failure.cause.recovery_suggestion());
    }

    // 根據錯誤嚴重程度決定退出碼
    let exit_code = summary.exit_code();
    if let Some(severity) = summary.worst_severity() {
        tracing::warn!(
            "⚠️ {} of {} pipelines failed (worst severity: {:?}, exit code {})",
            summary.failures.len(),
            summary.failures.len() + summary.reports.len(),
            severity,
            exit_code
        );
    }
    if exit_code > 0 {
        std::process::exit(exit_code);
    }

    Ok(())
}
