pub mod client;
pub mod pipedrive;
pub mod xero;
pub mod zendesk;

pub use client::ApiClient;
pub use pipedrive::PipedriveSource;
pub use xero::XeroSource;
pub use zendesk::ZendeskSource;

use crate::config::toml_config::{PipelineConfig, SourceConfig, SourceKind};
use crate::core::rate_limiter::RateLimiter;
use crate::core::retry::RetryPolicy;
use crate::domain::ports::SourceApi;
use crate::utils::error::{EtlError, Result};
use std::time::Duration;

/// Published limits of each API, used when the pipeline does not override them.
struct SourceDefaults {
    rate_limit_calls: usize,
    rate_limit_seconds: u64,
    page_size: usize,
}

impl SourceKind {
    fn defaults(&self) -> SourceDefaults {
        match self {
            SourceKind::Pipedrive => SourceDefaults {
                rate_limit_calls: 80,
                rate_limit_seconds: 2,
                page_size: 500,
            },
            SourceKind::Xero => SourceDefaults {
                rate_limit_calls: 59,
                rate_limit_seconds: 60,
                page_size: 100,
            },
            SourceKind::Zendesk => SourceDefaults {
                rate_limit_calls: 700,
                rate_limit_seconds: 60,
                page_size: 100,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pipedrive => "pipedrive",
            SourceKind::Xero => "xero",
            SourceKind::Zendesk => "zendesk",
        }
    }
}

fn required<'a>(pipeline: &str, field: &str, value: &'a Option<String>) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| EtlError::MissingConfigError {
            field: format!("pipelines.{}.source.{}", pipeline, field),
        })
}

pub fn client_for(config: &SourceConfig) -> Result<ApiClient> {
    let defaults = config.kind.defaults();
    let limiter = RateLimiter::new(
        config.rate_limit_calls.unwrap_or(defaults.rate_limit_calls),
        Duration::from_secs(config.rate_limit_seconds.unwrap_or(defaults.rate_limit_seconds)),
    );
    let retry = RetryPolicy {
        max_attempts: config.retry_attempts.unwrap_or(5),
        base_delay: Duration::from_secs(config.retry_delay_seconds.unwrap_or(2)),
        ..RetryPolicy::default()
    };
    ApiClient::new(config.kind.as_str(), config.timeout(), limiter, retry)
}

/// 依設定建立對應的來源 API
pub fn build_source(pipeline: &PipelineConfig) -> Result<Box<dyn SourceApi>> {
    let config = &pipeline.source;
    let client = client_for(config)?;
    let page_size = config.page_size.unwrap_or(config.kind.defaults().page_size);
    let name = pipeline.name.as_str();

    let source: Box<dyn SourceApi> = match config.kind {
        SourceKind::Pipedrive => Box::new(PipedriveSource::new(
            client,
            &config.base_url,
            required(name, "api_token", &config.api_token)?,
            page_size,
            config.drop_fields.clone().unwrap_or_default(),
        )),
        SourceKind::Xero => Box::new(XeroSource::new(
            client,
            &config.base_url,
            required(name, "access_token", &config.access_token)?,
            required(name, "tenant_id", &config.tenant_id)?,
        )),
        SourceKind::Zendesk => Box::new(ZendeskSource::new(
            client,
            &config.base_url,
            required(name, "email", &config.email)?,
            required(name, "token", &config.token)?,
            page_size,
            pipeline
                .categories
                .as_ref()
                .map(|c| c.names.clone())
                .unwrap_or_default(),
        )),
    };

    tracing::debug!(
        pipeline = name,
        source = config.kind.as_str(),
        "Built source client for {}",
        config.base_url
    );
    Ok(source)
}
