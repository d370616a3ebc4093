use super::client::ApiClient;
use crate::core::transform::{normalize_reference_id, parse_naive_timestamp};
use crate::domain::model::{Category, Record, RunStamp, Window};
use crate::domain::ports::SourceApi;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Reference fields that come back as null, floats or `{id, name}` objects.
const REFERENCE_FIELDS: &[&str] = &[
    "creator_user_id",
    "user_id",
    "person_id",
    "org_id",
    "stage_id",
    "pipeline_id",
    "last_activity_id",
    "next_activity_id",
];

/// Pipedrive deals (`GET /v1/deals`), paged with `start`/`limit`.
pub struct PipedriveSource {
    client: ApiClient,
    base_url: String,
    api_token: String,
    page_size: usize,
    drop_fields: Vec<String>,
}

impl PipedriveSource {
    pub fn new(
        client: ApiClient,
        base_url: &str,
        api_token: &str,
        page_size: usize,
        drop_fields: Vec<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            page_size,
            drop_fields,
        }
    }
}

#[async_trait]
impl SourceApi for PipedriveSource {
    fn name(&self) -> &str {
        self.client.source_name()
    }

    /// The deals endpoint has no creation filter: every page is read and the window is
    /// applied after mapping.
    async fn list_created(&self, window: &Window, _category: &Category) -> Result<Vec<Value>> {
        let url = format!("{}/v1/deals", self.base_url);
        let limit = self.page_size.to_string();
        let mut deals = Vec::new();
        let mut start = 0u64;

        loop {
            let start_param = start.to_string();
            let page = self
                .client
                .get_json("pipedrive deals", |c| {
                    c.get(&url).query(&[
                        ("api_token", self.api_token.as_str()),
                        ("start", start_param.as_str()),
                        ("limit", limit.as_str()),
                    ])
                })
                .await?;

            match page.get("data") {
                Some(Value::Array(items)) => deals.extend(items.iter().cloned()),
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(EtlError::ProcessingError {
                        message: format!("Pipedrive 'data' is not an array: {}", other),
                    })
                }
            }

            let pagination = &page["additional_data"]["pagination"];
            let more = pagination["more_items_in_collection"]
                .as_bool()
                .unwrap_or(false);
            match pagination["next_start"].as_u64() {
                Some(next) if more && next > start => start = next,
                _ => break,
            }
        }

        tracing::debug!("Pipedrive returned {} deals for {}", deals.len(), window);
        Ok(deals)
    }

    fn to_records(&self, raw: &Value, _category: &Category, run: &RunStamp) -> Result<Vec<Record>> {
        let deal = raw.as_object().ok_or_else(|| EtlError::ProcessingError {
            message: format!("Pipedrive deal is not an object: {}", raw),
        })?;

        let created_at = deal
            .get("add_time")
            .and_then(Value::as_str)
            .and_then(parse_naive_timestamp);

        let mut record = Record::new(created_at);
        for (field, value) in deal {
            if self.drop_fields.iter().any(|d| d == field) {
                continue;
            }
            if REFERENCE_FIELDS.contains(&field.as_str()) {
                record.insert(field, normalize_reference_id(Some(value)));
            } else {
                record.insert(field, value.clone());
            }
        }
        record.insert("etl_tstamp", run.etl_tstamp());
        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rate_limiter::RateLimiter;
    use crate::core::retry::RetryPolicy;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::time::Duration;

    fn source(base_url: &str) -> PipedriveSource {
        let client = ApiClient::new(
            "pipedrive",
            Duration::from_secs(5),
            RateLimiter::unlimited(),
            RetryPolicy::none(),
        )
        .unwrap();
        PipedriveSource::new(
            client,
            base_url,
            "pd-token",
            2,
            vec!["activities_count".to_string(), "probability".to_string()],
        )
    }

    fn run() -> RunStamp {
        RunStamp::new(
            NaiveDate::from_ymd_opt(2020, 3, 1)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn test_deal_mapping_drops_and_zero_fills() {
        let deal = json!({
            "id": 7,
            "title": "Big deal",
            "activities_count": 3,
            "probability": null,
            "last_activity_id": null,
            "next_activity_id": 41.0,
            "user_id": {"id": 12, "name": "Ann"},
            "add_time": "2020-02-28 09:15:00"
        });

        let records = source("http://localhost")
            .to_records(&deal, &Category::All, &run())
            .unwrap();
        let record = &records[0];

        assert!(record.get("activities_count").is_none());
        assert!(record.get("probability").is_none());
        assert_eq!(record.get("last_activity_id"), Some(&json!(0)));
        assert_eq!(record.get("next_activity_id"), Some(&json!(41)));
        assert_eq!(record.get("user_id"), Some(&json!(12)));
        assert_eq!(record.get("etl_tstamp"), Some(&json!("2020-03-01 06:00:00")));
        assert_eq!(
            record.created_at.map(|t| t.to_string()).as_deref(),
            Some("2020-02-28 09:15:00")
        );

        let fields: Vec<&str> = record.data.keys().map(String::as_str).collect();
        assert_eq!(fields.first(), Some(&"id"));
        assert_eq!(fields.last(), Some(&"etl_tstamp"));
    }

    #[test]
    fn test_non_object_deal_is_a_processing_error() {
        let err = source("http://localhost")
            .to_records(&json!([1, 2]), &Category::All, &run())
            .unwrap_err();
        assert!(matches!(err, EtlError::ProcessingError { .. }));
    }

    #[tokio::test]
    async fn test_empty_data_is_an_empty_page() {
        let server = httpmock::MockServer::start();
        server.mock(|when, then| {
            when.method(httpmock::Method::GET).path("/v1/deals");
            then.status(200).json_body(json!({
                "success": true,
                "data": null,
                "additional_data": {"pagination": {"more_items_in_collection": false}}
            }));
        });

        let deals = source(&server.base_url())
            .list_created(&Window::until(run().started_at), &Category::All)
            .await
            .unwrap();
        assert!(deals.is_empty());
    }
}
