use super::client::ApiClient;
use crate::core::transform::{
    extract_order_number, extract_skus, normalize_reference_id, normalize_timestamp,
    parse_zoned_timestamp, text,
};
use crate::domain::model::{Category, Record, RunStamp, Window};
use crate::domain::ports::SourceApi;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde_json::Value;

const SEARCH_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
/// 搜尋 API 最多回 1000 筆，再往下翻頁會得到 422
pub const SEARCH_RESULT_LIMIT: usize = 1000;

/// Zendesk tickets through the search API, one stream per ticket form.
pub struct ZendeskSource {
    client: ApiClient,
    base_url: String,
    email: String,
    token: String,
    page_size: usize,
    /// Every configured form; the uncategorised stream excludes them all.
    forms: Vec<String>,
}

impl ZendeskSource {
    pub fn new(
        client: ApiClient,
        base_url: &str,
        email: &str,
        token: &str,
        page_size: usize,
        forms: Vec<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            token: token.to_string(),
            page_size,
            forms,
        }
    }

    /// 搜尋語法：`type:ticket created>=… created<… form:"…"`
    pub fn search_query(&self, window: &Window, category: &Category) -> String {
        let mut query = String::from("type:ticket");
        if let Some(start) = window.start {
            query.push_str(&format!(" created>={}", start.format(SEARCH_TIME_FORMAT)));
        }
        query.push_str(&format!(" created<{}", window.end.format(SEARCH_TIME_FORMAT)));

        match category {
            Category::All => {}
            Category::Named(form) => query.push_str(&format!(" form:\"{}\"", form)),
            Category::Uncategorised => {
                for form in &self.forms {
                    query.push_str(&format!(" -form:\"{}\"", form));
                }
            }
        }
        query
    }

    fn search(&self, c: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
        c.get(url)
            .basic_auth(format!("{}/token", self.email), Some(&self.token))
    }
}

/// 截斷的結果只到某一秒的一部分；丟掉最後那一秒，下次從水位+1s 續抓才不會漏。
/// 整批都在同一秒時全部保留。
pub fn trim_partial_second(tickets: &mut Vec<Value>) -> usize {
    let created = |ticket: &Value| parse_zoned_timestamp(&text(ticket.get("created_at")));
    let Some(last) = tickets.last().and_then(created) else {
        return 0;
    };
    let keep = tickets
        .iter()
        .rposition(|ticket| created(ticket).is_some_and(|t| t < last))
        .map_or(0, |i| i + 1);
    if keep == 0 {
        return 0;
    }
    let dropped = tickets.len() - keep;
    tickets.truncate(keep);
    dropped
}

#[async_trait]
impl SourceApi for ZendeskSource {
    fn name(&self) -> &str {
        self.client.source_name()
    }

    async fn list_created(&self, window: &Window, category: &Category) -> Result<Vec<Value>> {
        let query = self.search_query(window, category);
        tracing::debug!("Zendesk search: {}", query);

        let first_url = format!("{}/api/v2/search.json", self.base_url);
        let per_page = self.page_size.to_string();
        let mut tickets = Vec::new();

        let mut page = self
            .client
            .get_json("zendesk search", |c| {
                self.search(c, &first_url).query(&[
                    ("query", query.as_str()),
                    ("sort_by", "created_at"),
                    ("sort_order", "asc"),
                    ("per_page", per_page.as_str()),
                ])
            })
            .await?;

        loop {
            if let Some(results) = page.get("results").and_then(Value::as_array) {
                tickets.extend(results.iter().cloned());
            }

            // next_page 已帶好完整查詢參數
            let next = match page.get("next_page").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => next.to_string(),
                _ => break,
            };
            if tickets.len() >= SEARCH_RESULT_LIMIT {
                let dropped = trim_partial_second(&mut tickets);
                tracing::warn!(
                    loaded = tickets.len(),
                    dropped,
                    "⚠️ Zendesk search hit its {} result cap, the rest of {} is left for the next run",
                    SEARCH_RESULT_LIMIT,
                    window
                );
                break;
            }
            page = self
                .client
                .get_json("zendesk search", |c| self.search(c, &next))
                .await?;
        }

        Ok(tickets)
    }

    fn to_records(&self, raw: &Value, category: &Category, run: &RunStamp) -> Result<Vec<Record>> {
        if !raw.is_object() {
            return Err(EtlError::ProcessingError {
                message: format!("Zendesk ticket is not an object: {}", raw),
            });
        }

        let created_raw = text(raw.get("created_at"));
        let subject = text(raw.get("subject"));
        let description = text(raw.get("description"));

        let tags = raw
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();

        let satisfaction_rating = match raw.get("satisfaction_rating") {
            Some(Value::Object(rating)) => text(rating.get("score")),
            other => text(other),
        };

        let mut record = Record::new(parse_zoned_timestamp(&created_raw));
        record.insert("id", normalize_reference_id(raw.get("id")));
        record.insert("ticket_form", category.tag());
        record.insert("subject", subject.as_str());
        record.insert("skus", extract_skus(&description));
        record.insert("order_id", extract_order_number(&subject));
        record.insert("status", text(raw.get("status")));
        record.insert("type", text(raw.get("type")));
        record.insert("description", description.as_str());
        record.insert("created_at", normalize_timestamp(&created_raw));
        for field in ["brand_id", "group_id", "assignee_id", "submitter_id"] {
            record.insert(field, normalize_reference_id(raw.get(field)));
        }
        record.insert("recipient", text(raw.get("recipient")));
        record.insert("raw_subject", text(raw.get("raw_subject")));
        record.insert("tags", tags);
        record.insert("is_public", raw.get("is_public").and_then(Value::as_bool).unwrap_or(false));
        record.insert("satisfaction_rating", satisfaction_rating);
        record.insert(
            "allow_channelback",
            raw.get("allow_channelback")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        );
        record.insert("etl_tstamp", run.etl_tstamp());
        Ok(vec![record])
    }
}
