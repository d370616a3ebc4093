use crate::utils::error::Result;
use crate::utils::validation::{self, Validate};
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "saas-etl")]
#[command(about = "Extract SaaS API records, stage them to S3 and COPY them into Redshift")]
pub struct CliConfig {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "etl.toml")]
    pub config: String,

    /// Run only this pipeline (repeatable); all enabled pipelines when omitted
    #[arg(short, long = "pipeline")]
    pub pipelines: Vec<String>,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    /// Log process CPU and memory after each stage
    #[arg(long)]
    pub monitor: bool,

    /// Show staging keys and warehouse commands without executing
    #[arg(long)]
    pub dry_run: bool,
}

impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_path("config", &self.config)?;
        for name in &self.pipelines {
            validation::validate_non_empty_string("pipeline", name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeatable_pipeline_flag() {
        let config = CliConfig::parse_from([
            "saas-etl",
            "--config",
            "prod.toml",
            "--pipeline",
            "zendesk_tickets",
            "-p",
            "xero_line_items",
            "--dry-run",
        ]);
        assert_eq!(config.config, "prod.toml");
        assert_eq!(config.pipelines, vec!["zendesk_tickets", "xero_line_items"]);
        assert!(config.dry_run);
        assert!(!config.monitor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::parse_from(["saas-etl"]);
        assert_eq!(config.config, "etl.toml");
        assert!(config.pipelines.is_empty());
    }
}
