use crate::config::toml_config::EtlConfig;
use crate::core::sql;
use crate::core::stage::staging_key;
use crate::domain::model::{LoadPolicy, RunStamp};
use crate::utils::error::Result;
use std::fmt;

/// What one category would do, without touching any external system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCategory {
    pub category: String,
    pub watermark_query: Option<String>,
    pub staging_key: String,
    pub statements: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPipeline {
    pub pipeline: String,
    pub source: String,
    pub categories: Vec<PlannedCategory>,
    /// Post-load statements (maintenance or deduplication).
    pub finally: Vec<String>,
}

/// 乾跑：列出 staging key 與會執行的倉儲指令 (憑證已遮蔽)
pub fn plan(config: &EtlConfig, names: &[String], run: &RunStamp) -> Result<Vec<PlannedPipeline>> {
    let credentials = &config.warehouse.copy_credentials;

    config
        .selected_pipelines(names)?
        .into_iter()
        .map(|pipeline| {
            let spec = config.spec_for(pipeline);
            let table = spec.target.table.as_str();

            let categories = spec
                .categories
                .iter()
                .map(|category| {
                    let key =
                        staging_key(&spec.key_prefix, &spec.name, category, run, spec.copy.format);
                    let uri = config.object_store.uri(&key);
                    let mut statements = Vec::new();
                    if spec.policy == LoadPolicy::FullRefresh {
                        statements.push(sql::delete_all(table));
                    }
                    statements.push(sql::copy_redacted(table, &uri, &spec.copy, credentials));

                    PlannedCategory {
                        category: category.label().to_string(),
                        watermark_query: (spec.policy == LoadPolicy::Incremental)
                            .then(|| sql::max_timestamp(&spec.target, category)),
                        staging_key: key,
                        statements,
                    }
                })
                .collect();

            let mut finally = Vec::new();
            match spec.policy {
                LoadPolicy::FullRefresh => {
                    finally.push(sql::vacuum(table));
                    finally.push(sql::analyze(table));
                }
                LoadPolicy::Incremental if spec.deduplicate => {
                    if let Some(dedup) = sql::dedup_statements(&spec.target) {
                        finally.extend(dedup.drop_shadowed);
                        finally.extend([
                            dedup.drop_stale,
                            dedup.collect_copies,
                            dedup.drop_copies,
                            dedup.restore_single,
                            dedup.drop_scratch,
                        ]);
                    }
                }
                LoadPolicy::Incremental => {}
            }

            Ok(PlannedPipeline {
                pipeline: spec.name.clone(),
                source: pipeline.source.kind.as_str().to_string(),
                categories,
                finally,
            })
        })
        .collect()
}

impl fmt::Display for PlannedPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📋 Pipeline: {} (source: {})", self.pipeline, self.source)?;
        for category in &self.categories {
            writeln!(f, "  ▶ {}", category.category)?;
            if let Some(query) = &category.watermark_query {
                writeln!(f, "    watermark: {}", query)?;
            }
            writeln!(f, "    stage:     {}", category.staging_key)?;
            for statement in &category.statements {
                writeln!(f, "    load:      {}", statement)?;
            }
        }
        for statement in &self.finally {
            writeln!(f, "  finally:     {}", statement)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const CONFIG: &str = r#"
[run]
initial_backfill_start = "2015-01-01 00:00:00"

[object_store]
bucket = "csv-repository"
region = "eu-west-1"
prefix = "etl/"

[warehouse]
dsn = "postgres://etl@localhost:5439/public"

[warehouse.copy_credentials]
access_key_id = "AKIA"
secret_access_key = "very-secret"

[[pipelines]]
name = "pipedrive_deals"

[pipelines.source]
kind = "pipedrive"
base_url = "https://api.pipedrive.com"
api_token = "pd"

[pipelines.target]
table = "pipedrive.leads"
timestamp_column = "add_time"

[pipelines.load]
policy = "full_refresh"
format = "csv"
"#;

    #[test]
    fn test_full_refresh_plan() {
        let config = EtlConfig::from_toml_str(CONFIG).unwrap();
        let run = RunStamp::new(
            NaiveDate::from_ymd_opt(2020, 3, 1)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap(),
        );

        let plans = plan(&config, &[], &run).unwrap();
        assert_eq!(plans.len(), 1);

        let pipeline = &plans[0];
        assert_eq!(pipeline.source, "pipedrive");
        let category = &pipeline.categories[0];
        assert_eq!(category.staging_key, "etl/2020_03_01_pipedrive_deals.csv");
        assert_eq!(category.watermark_query, None);
        assert_eq!(category.statements[0], "DELETE FROM pipedrive.leads");
        assert!(category.statements[1]
            .starts_with("COPY pipedrive.leads FROM 's3://csv-repository/etl/2020_03_01_pipedrive_deals.csv'"));
        assert_eq!(
            pipeline.finally,
            vec!["VACUUM pipedrive.leads", "ANALYZE pipedrive.leads"]
        );

        let rendered = pipeline.to_string();
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("📋 Pipeline: pipedrive_deals"));
    }
}
