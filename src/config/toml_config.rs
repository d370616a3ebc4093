use crate::core::etl::EngineSettings;
use crate::core::sql::CopyCredentials;
use crate::core::transform::parse_naive_timestamp;
use crate::domain::model::{
    Category, CopyOptions, LoadPolicy, PipelineSpec, StageFormat, TargetTable,
    WatermarkGranularity,
};
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub run: RunConfig,
    pub object_store: ObjectStoreConfig,
    pub warehouse: WarehouseConfig,
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// 表內沒有任何資料時的起始時間 (UTC)
    pub initial_backfill_start: String,
    #[serde(default = "default_lock_table")]
    pub lock_table: String,
    pub lock_lease_minutes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
    pub prefix: Option<String>,
    /// S3-compatible endpoint (MinIO, localstack).
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub dsn: String,
    pub max_connections: Option<u32>,
    pub connect_timeout_seconds: Option<u64>,
    pub copy_credentials: CopyCredentials,
}

impl std::fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("dsn", &"***")
            .field("max_connections", &self.max_connections)
            .field("copy_credentials", &self.copy_credentials)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub categories: Option<CategoriesConfig>,
    pub load: LoadConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Pipedrive,
    Xero,
    Zendesk,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub base_url: String,
    // Pipedrive
    pub api_token: Option<String>,
    // Zendesk
    pub email: Option<String>,
    pub token: Option<String>,
    // Xero
    pub access_token: Option<String>,
    pub tenant_id: Option<String>,

    pub timeout_seconds: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub rate_limit_calls: Option<usize>,
    pub rate_limit_seconds: Option<u64>,
    pub page_size: Option<usize>,
    /// Source fields left out of the target rows.
    pub drop_fields: Option<Vec<String>>,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("rate_limit_calls", &self.rate_limit_calls)
            .field("rate_limit_seconds", &self.rate_limit_seconds)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub table: String,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    /// `day` for date-only columns; Xero invoice dates default to it.
    pub watermark_granularity: Option<WatermarkGranularity>,
    pub category_column: Option<String>,
    pub key_column: Option<String>,
    #[serde(default = "default_etl_timestamp_column")]
    pub etl_timestamp_column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoriesConfig {
    pub names: Vec<String>,
    pub include_uncategorised: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    pub policy: LoadPolicy,
    pub format: StageFormat,
    /// Object key of the jsonpaths file; JSON 'auto' when absent.
    pub json_paths_key: Option<String>,
    pub accept_invalid_chars: Option<bool>,
    pub deduplicate: Option<bool>,
    pub columns: Option<Vec<String>>,
}

fn default_staging_dir() -> String {
    "./staging".to_string()
}

fn default_lock_table() -> String {
    "etl.run_locks".to_string()
}

fn default_timestamp_column() -> String {
    "created_at".to_string()
}

fn default_etl_timestamp_column() -> String {
    "etl_tstamp".to_string()
}

impl EtlConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${ZENDESK_TOKEN})；未設定的變數直接報錯，憑證不可默默留空
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| EtlError::ConfigError {
            message: e.to_string(),
        })?;

        let mut missing = Vec::new();
        let mut lines = Vec::new();
        for line in content.lines() {
            if line.trim_start().starts_with('#') {
                lines.push(line.to_string());
                continue;
            }
            let replaced = re.replace_all(line, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| {
                    missing.push(var_name.to_string());
                    String::new()
                })
            });
            lines.push(replaced.into_owned());
        }

        if let Some(var_name) = missing.into_iter().next() {
            return Err(EtlError::MissingConfigError {
                field: format!("environment variable {}", var_name),
            });
        }
        Ok(lines.join("\n"))
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_path("run.staging_dir", &self.run.staging_dir)?;
        self.initial_backfill_start()?;
        validation::validate_sql_identifier("run.lock_table", &self.run.lock_table)?;
        if let Some(minutes) = self.run.lock_lease_minutes {
            validation::validate_positive_number("run.lock_lease_minutes", minutes as usize, 1)?;
        }

        validation::validate_s3_bucket_name("object_store.bucket", &self.object_store.bucket)?;
        validation::validate_aws_region("object_store.region", &self.object_store.region)?;
        if let Some(endpoint) = &self.object_store.endpoint_url {
            validation::validate_url("object_store.endpoint_url", endpoint)?;
        }

        validation::validate_secret("warehouse.dsn", &self.warehouse.dsn)?;
        match &self.warehouse.copy_credentials {
            CopyCredentials::IamRole { iam_role } => {
                validation::validate_secret("warehouse.copy_credentials.iam_role", iam_role)?
            }
            CopyCredentials::AccessKeys {
                access_key_id,
                secret_access_key,
            } => {
                validation::validate_secret(
                    "warehouse.copy_credentials.access_key_id",
                    access_key_id,
                )?;
                validation::validate_secret(
                    "warehouse.copy_credentials.secret_access_key",
                    secret_access_key,
                )?;
            }
        }

        if self.pipelines.is_empty() {
            return Err(EtlError::MissingConfigError {
                field: "pipelines".to_string(),
            });
        }
        validation::validate_unique_names(
            "pipelines.name",
            self.pipelines.iter().map(|p| p.name.as_str()),
        )?;
        for pipeline in &self.pipelines {
            pipeline.validate()?;
        }
        Ok(())
    }

    pub fn initial_backfill_start(&self) -> Result<chrono::NaiveDateTime> {
        parse_naive_timestamp(&self.run.initial_backfill_start).ok_or_else(|| {
            EtlError::InvalidConfigValueError {
                field: "run.initial_backfill_start".to_string(),
                value: self.run.initial_backfill_start.clone(),
                reason: "Expected YYYY-MM-DD HH:MM:SS".to_string(),
            }
        })
    }

    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            staging_dir: PathBuf::from(&self.run.staging_dir),
            initial_backfill_start: self.initial_backfill_start()?,
            lease: chrono::Duration::minutes(self.run.lock_lease_minutes.unwrap_or(120) as i64),
        })
    }

    /// Pipelines to run: the named ones in the given order, or every enabled one.
    pub fn selected_pipelines(&self, names: &[String]) -> Result<Vec<&PipelineConfig>> {
        if names.is_empty() {
            return Ok(self.pipelines.iter().filter(|p| p.is_enabled()).collect());
        }
        names
            .iter()
            .map(|name| {
                self.pipelines
                    .iter()
                    .find(|p| &p.name == name)
                    .ok_or_else(|| EtlError::InvalidConfigValueError {
                        field: "pipeline".to_string(),
                        value: name.clone(),
                        reason: "No pipeline with this name in the configuration".to_string(),
                    })
            })
            .collect()
    }

    pub fn spec_for(&self, pipeline: &PipelineConfig) -> PipelineSpec {
        pipeline.to_spec(&self.object_store)
    }
}

impl ObjectStoreConfig {
    pub fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    pub fn key_prefix(&self) -> String {
        match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(p) if !p.is_empty() => format!("{}/", p),
            _ => String::new(),
        }
    }
}

impl PipelineConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// 無分類設定時只有一個 All；未分類串流排在具名分類之前
    pub fn categories(&self) -> Vec<Category> {
        match &self.categories {
            None => vec![Category::All],
            Some(config) => {
                let mut categories = Vec::with_capacity(config.names.len() + 1);
                if config.include_uncategorised.unwrap_or(true) {
                    categories.push(Category::Uncategorised);
                }
                categories.extend(config.names.iter().cloned().map(Category::Named));
                categories
            }
        }
    }

    pub fn watermark_granularity(&self) -> WatermarkGranularity {
        self.target
            .watermark_granularity
            .unwrap_or(match self.source.kind {
                SourceKind::Xero => WatermarkGranularity::Day,
                SourceKind::Pipedrive | SourceKind::Zendesk => WatermarkGranularity::Second,
            })
    }

    pub fn target(&self) -> TargetTable {
        TargetTable {
            table: self.target.table.clone(),
            timestamp_column: self.target.timestamp_column.clone(),
            watermark_granularity: self.watermark_granularity(),
            category_column: self.target.category_column.clone(),
            key_column: self.target.key_column.clone(),
            etl_timestamp_column: self.target.etl_timestamp_column.clone(),
        }
    }

    pub fn to_spec(&self, object_store: &ObjectStoreConfig) -> PipelineSpec {
        PipelineSpec {
            name: self.name.clone(),
            policy: self.load.policy,
            target: self.target(),
            categories: self.categories(),
            copy: CopyOptions {
                format: self.load.format,
                json_paths_uri: self
                    .load
                    .json_paths_key
                    .as_deref()
                    .map(|key| object_store.uri(key)),
                accept_invalid_chars: self.load.accept_invalid_chars.unwrap_or(false),
            },
            columns: self.load.columns.clone(),
            key_prefix: object_store.key_prefix(),
            deduplicate: self.load.deduplicate.unwrap_or(false),
        }
    }

    fn field(&self, name: &str) -> String {
        format!("pipelines.{}.{}", self.name, name)
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_sql_identifier(&self.field("name"), &self.name)?;
        self.source.validate_for(&self.name)?;

        validation::validate_sql_identifier(&self.field("target.table"), &self.target.table)?;
        validation::validate_sql_identifier(
            &self.field("target.timestamp_column"),
            &self.target.timestamp_column,
        )?;
        validation::validate_sql_identifier(
            &self.field("target.etl_timestamp_column"),
            &self.target.etl_timestamp_column,
        )?;
        for (name, column) in [
            ("target.category_column", &self.target.category_column),
            ("target.key_column", &self.target.key_column),
        ] {
            if let Some(column) = column {
                validation::validate_sql_identifier(&self.field(name), column)?;
            }
        }

        if let Some(categories) = &self.categories {
            if self.target.category_column.is_none() {
                return Err(EtlError::MissingConfigError {
                    field: self.field("target.category_column"),
                });
            }
            validation::validate_unique_names(
                &self.field("categories.names"),
                categories.names.iter().map(String::as_str),
            )?;
            for name in &categories.names {
                validation::validate_non_empty_string(&self.field("categories.names"), name)?;
            }
            if categories.names.is_empty() && !categories.include_uncategorised.unwrap_or(true) {
                return Err(EtlError::InvalidConfigValueError {
                    field: self.field("categories"),
                    value: "include_uncategorised = false".to_string(),
                    reason: "No category left to extract; list names or include uncategorised"
                        .to_string(),
                });
            }
            if self.load.policy == LoadPolicy::FullRefresh {
                return Err(EtlError::InvalidConfigValueError {
                    field: self.field("load.policy"),
                    value: "full_refresh".to_string(),
                    reason: "A full refresh would delete the other categories' rows".to_string(),
                });
            }
        }

        let deduplicate = self.load.deduplicate.unwrap_or(false);
        if deduplicate && self.target.key_column.is_none() {
            return Err(EtlError::InvalidConfigValueError {
                field: self.field("load.deduplicate"),
                value: "true".to_string(),
                reason: "Deduplication needs target.key_column".to_string(),
            });
        }

        // 整天重讀會重複載入同一天的列，必須靠去重收斂
        if self.load.policy == LoadPolicy::Incremental
            && self.watermark_granularity() == WatermarkGranularity::Day
            && !deduplicate
        {
            return Err(EtlError::InvalidConfigValueError {
                field: self.field("target.watermark_granularity"),
                value: "day".to_string(),
                reason: "A day watermark re-reads its day; set load.deduplicate and target.key_column"
                    .to_string(),
            });
        }

        if let Some(key) = &self.load.json_paths_key {
            validation::validate_non_empty_string(&self.field("load.json_paths_key"), key)?;
            if self.load.format != StageFormat::Json {
                return Err(EtlError::InvalidConfigValueError {
                    field: self.field("load.json_paths_key"),
                    value: key.clone(),
                    reason: "Only JSON staging uses a jsonpaths file".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl SourceConfig {
    fn validate_for(&self, pipeline: &str) -> Result<()> {
        let field = |name: &str| format!("pipelines.{}.source.{}", pipeline, name);
        validation::validate_url(&field("base_url"), &self.base_url)?;

        let required: Vec<(&str, &Option<String>)> = match self.kind {
            SourceKind::Pipedrive => vec![("api_token", &self.api_token)],
            SourceKind::Zendesk => vec![("email", &self.email), ("token", &self.token)],
            SourceKind::Xero => vec![
                ("access_token", &self.access_token),
                ("tenant_id", &self.tenant_id),
            ],
        };
        for (name, value) in required {
            let value = validation::validate_required_field(&field(name), value)?;
            validation::validate_secret(&field(name), value)?;
        }

        for (name, value) in [
            ("rate_limit_calls", self.rate_limit_calls),
            ("page_size", self.page_size),
        ] {
            if let Some(value) = value {
                validation::validate_positive_number(&field(name), value, 1)?;
            }
        }
        if let Some(attempts) = self.retry_attempts {
            validation::validate_positive_number(&field("retry_attempts"), attempts as usize, 1)?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(60))
    }
}

impl Validate for EtlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
