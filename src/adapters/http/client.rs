use crate::core::rate_limiter::RateLimiter;
use crate::core::retry::RetryPolicy;
use crate::utils::error::{EtlError, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

const MAX_ERROR_BODY: usize = 512;

/// reqwest client shared by every request of one source: rate limited and retried.
#[derive(Debug)]
pub struct ApiClient {
    source_name: String,
    client: Client,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        source_name: &str,
        timeout: Duration,
        limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("saas-etl/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            source_name: source_name.to_string(),
            client,
            limiter,
            retry,
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// 每次嘗試都重新建立請求並先取得限流配額
    pub async fn get_json<F>(&self, label: &str, build: F) -> Result<Value>
    where
        F: Fn(&Client) -> RequestBuilder + Sync,
    {
        let build = &build;
        self.retry
            .run(label, || async move {
                self.limiter.acquire().await;
                let response = build(&self.client).send().await?;
                self.read_json(response).await
            })
            .await
    }

    async fn read_json(&self, response: Response) -> Result<Value> {
        let status = response.status();
        tracing::debug!(source = %self.source_name, "API response status: {}", status);

        if status.is_success() {
            return Ok(response.json::<Value>().await?);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EtlError::AuthError {
                source_name: self.source_name.clone(),
                status: status.as_u16(),
            });
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| body.is_char_boundary(*i))
                .unwrap_or(0);
            body.truncate(cut);
        }

        Err(EtlError::HttpStatusError {
            source_name: self.source_name.clone(),
            status: status.as_u16(),
            retry_after,
            body,
        })
    }
}
