use super::client::ApiClient;
use crate::core::transform::{parse_naive_timestamp, text};
use crate::domain::model::{Category, Record, RunStamp, Window, WAREHOUSE_TIMESTAMP_FORMAT};
use crate::domain::ports::SourceApi;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Invoices per list page; a shorter page is the last one.
const XERO_PAGE_SIZE: usize = 100;

/// Xero invoice line items: list invoices by date, then one detail call per invoice.
pub struct XeroSource {
    client: ApiClient,
    base_url: String,
    access_token: String,
    tenant_id: String,
}

impl XeroSource {
    pub fn new(client: ApiClient, base_url: &str, access_token: &str, tenant_id: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            tenant_id: tenant_id.to_string(),
        }
    }

    fn get(&self, c: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
        c.get(url)
            .bearer_auth(&self.access_token)
            .header("xero-tenant-id", &self.tenant_id)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn list_page(&self, page: usize, filter: Option<&str>) -> Result<Vec<Value>> {
        let url = format!("{}/api.xro/2.0/Invoices", self.base_url);
        let page_param = page.to_string();
        let body = self
            .client
            .get_json("xero invoices", |c| {
                let request = self.get(c, &url).query(&[("page", page_param.as_str())]);
                match filter {
                    Some(filter) => request.query(&[("where", filter)]),
                    None => request,
                }
            })
            .await?;
        Ok(invoices_of(&body))
    }

    async fn detail(&self, invoice_id: &str) -> Result<Value> {
        let url = format!("{}/api.xro/2.0/Invoices/{}", self.base_url, invoice_id);
        let body = self
            .client
            .get_json("xero invoice detail", |c| self.get(c, &url))
            .await?;
        invoices_of(&body)
            .into_iter()
            .next()
            .ok_or_else(|| EtlError::ProcessingError {
                message: format!("Xero returned no invoice for {}", invoice_id),
            })
    }
}

fn invoices_of(body: &Value) -> Vec<Value> {
    body.get("Invoices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// `where` clause selecting invoices dated on or after the window start.
pub fn date_filter(window: &Window) -> Option<String> {
    window.start.map(|start| {
        format!(
            "Date>=DateTime({},{:02},{:02})",
            start.year(),
            start.month(),
            start.day()
        )
    })
}

fn ms_date_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^/Date\((-?\d+)([+-]\d{4})?\)/$").expect("date pattern is valid"))
}

/// 發票日期：優先用 DateString，否則解析 `/Date(1582934400000+0000)/`
pub fn invoice_date(invoice: &Value) -> Option<NaiveDateTime> {
    if let Some(date) = invoice
        .get("DateString")
        .and_then(Value::as_str)
        .and_then(parse_naive_timestamp)
    {
        return Some(date);
    }

    let raw = invoice.get("Date").and_then(Value::as_str)?;
    let caps = ms_date_pattern().captures(raw.trim())?;
    let millis: i64 = caps[1].parse().ok()?;
    DateTime::from_timestamp_millis(millis).map(|t| t.naive_utc())
}

#[async_trait]
impl SourceApi for XeroSource {
    fn name(&self) -> &str {
        self.client.source_name()
    }

    async fn list_created(&self, window: &Window, _category: &Category) -> Result<Vec<Value>> {
        let filter = date_filter(window);
        let mut invoice_ids = Vec::new();
        let mut page = 1;

        loop {
            let invoices = self.list_page(page, filter.as_deref()).await?;
            let fetched = invoices.len();
            for invoice in &invoices {
                // 清單已帶日期，視窗外的不必再打 detail
                if !window.contains(invoice_date(invoice)) {
                    continue;
                }
                if let Some(id) = invoice.get("InvoiceID").and_then(Value::as_str) {
                    invoice_ids.push(id.to_string());
                }
            }
            if fetched < XERO_PAGE_SIZE {
                break;
            }
            page += 1;
        }

        tracing::info!(
            "Fetching {} Xero invoice details ({} calls per {:?})",
            invoice_ids.len(),
            self.client.limiter().max_calls(),
            self.client.limiter().period()
        );

        let mut details = Vec::with_capacity(invoice_ids.len());
        for id in &invoice_ids {
            details.push(self.detail(id).await?);
        }
        Ok(details)
    }

    /// One record per line item, stamped with the invoice it belongs to.
    fn to_records(&self, raw: &Value, _category: &Category, run: &RunStamp) -> Result<Vec<Record>> {
        let invoice_id = text(raw.get("InvoiceID"));
        if invoice_id.is_empty() {
            return Err(EtlError::ProcessingError {
                message: "Xero invoice without InvoiceID".to_string(),
            });
        }
        let contact_id = text(raw.get("Contact").and_then(|c| c.get("ContactID")));
        let date = invoice_date(raw);
        let date_column = date
            .map(|d| Value::from(d.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string()))
            .unwrap_or(Value::Null);

        let line_items = raw
            .get("LineItems")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        line_items
            .iter()
            .map(|item| {
                let fields = item.as_object().ok_or_else(|| EtlError::ProcessingError {
                    message: format!("Xero line item of {} is not an object", invoice_id),
                })?;
                let mut record = Record::new(date);
                for (field, value) in fields {
                    record.insert(field, value.clone());
                }
                record.insert("InvoiceID", invoice_id.as_str());
                record.insert("ContactID", contact_id.as_str());
                record.insert("invoice_date", date_column.clone());
                record.insert("etl_tstamp", run.etl_tstamp());
                Ok(record)
            })
            .collect()
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

    fn source() -> XeroSource {
        let client = ApiClient::new(
            "xero",
            Duration::from_secs(5),
            RateLimiter::unlimited(),
            RetryPolicy::none(),
        )
        .unwrap();
        XeroSource::new(client, "http://localhost/", "token", "tenant")
    }

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 2, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_invoice_date_formats() {
        assert_eq!(
            invoice_date(&json!({"DateString": "2020-02-29T00:00:00"})),
            Some(day(29))
        );
        assert_eq!(
            invoice_date(&json!({"Date": "/Date(1582934400000+0000)/"})),
            Some(day(29))
        );
        assert_eq!(invoice_date(&json!({"Date": "yesterday"})), None);
    }

    #[test]
    fn test_date_filter() {
        let window = Window::new(day(3) + chrono::Duration::seconds(1), day(29));
        assert_eq!(
            date_filter(&window).as_deref(),
            Some("Date>=DateTime(2020,02,03)")
        );
        assert_eq!(date_filter(&Window::until(day(29))), None);
    }

    #[test]
    fn test_line_items_are_flattened() {
        let invoice = json!({
            "InvoiceID": "inv-1",
            "Contact": {"ContactID": "c-9", "Name": "Acme"},
            "DateString": "2020-02-10T00:00:00",
            "LineItems": [
                {"LineItemID": "l-1", "Description": "Widget", "Quantity": 2.0},
                {"LineItemID": "l-2", "Description": "Gadget", "Quantity": 1.0}
            ]
        });
        let run = RunStamp::new(day(29));

        let records = source()
            .to_records(&invoice, &Category::All, &run)
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("LineItemID"), Some(&json!("l-2")));
        for record in &records {
            assert_eq!(record.get("InvoiceID"), Some(&json!("inv-1")));
            assert_eq!(record.get("ContactID"), Some(&json!("c-9")));
            assert_eq!(record.get("invoice_date"), Some(&json!("2020-02-10 00:00:00")));
            assert_eq!(record.created_at, Some(day(10)));
        }
    }

    #[test]
    fn test_invoice_without_line_items_maps_to_nothing() {
        let invoice = json!({"InvoiceID": "inv-2", "LineItems": []});
        let records = source()
            .to_records(&invoice, &Category::All, &RunStamp::new(day(29)))
            .unwrap();
        assert!(records.is_empty());
    }
}
