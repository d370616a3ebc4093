use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{self, Validate};
use std::env;

pub const CONFIG_PATH_ENV: &str = "ETL_CONFIG_PATH";
pub const PIPELINES_ENV: &str = "ETL_PIPELINES";

/// Where the Lambda finds its TOML file and which pipelines one invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaConfig {
    pub config_path: String,
    pub pipelines: Vec<String>,
}

impl LambdaConfig {
    /// 事件內容優先，其次是環境變數
    pub fn resolve(config_path: Option<String>, pipelines: Option<Vec<String>>) -> Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => env::var(CONFIG_PATH_ENV).map_err(|_| EtlError::ConfigError {
                message: format!("{} environment variable is required", CONFIG_PATH_ENV),
            })?,
        };

        let pipelines = pipelines.unwrap_or_else(|| {
            env::var(PIPELINES_ENV)
                .map(|names| {
                    names
                        .split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default()
        });

        Ok(Self {
            config_path,
            pipelines,
        })
    }
}

impl Validate for LambdaConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_path("config_path", &self.config_path)?;
        for name in &self.pipelines {
            validation::validate_non_empty_string("pipelines", name)?;
        }
        tracing::info!("✅ Lambda configuration validation passed");
        Ok(())
    }
}
