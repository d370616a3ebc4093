//! Per-record field transforms shared by the source mappings.

use crate::domain::model::WAREHOUSE_TIMESTAMP_FORMAT;
use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

const ORDER_NUMBER_SENTINEL: &str = "0";

fn order_number_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"1000[0-9]{5}").expect("order number pattern is valid"))
}

fn sku_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9]{8}-[0-9]{3}").expect("sku pattern is valid"))
}

/// 從主旨擷取訂單編號 (1000 開頭共 9 碼)，找不到時回傳 "0"
pub fn extract_order_number(subject: &str) -> String {
    order_number_pattern()
        .find(subject)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| ORDER_NUMBER_SENTINEL.to_string())
}

/// RFC 3339 timestamp with zone to the warehouse's naive UTC format.
pub fn normalize_timestamp(value: &str) -> Option<String> {
    parse_zoned_timestamp(value).map(|t| t.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string())
}

pub fn parse_zoned_timestamp(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.naive_utc())
}

/// Naive timestamps as some APIs return them (`2020-03-01 12:30:00`, `2020-03-01T00:00:00`).
pub fn parse_naive_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, WAREHOUSE_TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

/// SKU codes at the start of space-separated words, first appearance order, no repeats.
pub fn extract_skus(text: &str) -> Vec<String> {
    let mut skus: Vec<String> = Vec::new();
    for line in text.lines() {
        for word in line.split(' ') {
            if let Some(m) = sku_pattern().find(word) {
                let sku = m.as_str();
                if !skus.iter().any(|s| s == sku) {
                    skus.push(sku.to_string());
                }
            }
        }
    }
    skus
}

/// 可為空的數值參照欄位一律補 0，浮點數截成整數
pub fn normalize_reference_id(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse::<f64>().map(|f| f.trunc() as i64).unwrap_or(0),
        // 有些 API 以物件回傳參照 ({"id": 12, "name": ...})
        Some(Value::Object(obj)) => normalize_reference_id(obj.get("id")),
        _ => 0,
    }
}

/// Text rendering of a JSON value for string columns; null becomes empty.
pub fn text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_order_number() {
        assert_eq!(
            extract_order_number("Where is my order 100012345?"),
            "100012345"
        );
        assert_eq!(extract_order_number("Order #100099999 damaged"), "100099999");
        assert_eq!(extract_order_number("General question"), "0");
        assert_eq!(extract_order_number("order 10001234"), "0");
        assert_eq!(extract_order_number(""), "0");
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(
            normalize_timestamp("2020-03-01T12:30:00Z").as_deref(),
            Some("2020-03-01 12:30:00")
        );
        assert_eq!(
            normalize_timestamp("2020-03-01T14:30:00+02:00").as_deref(),
            Some("2020-03-01 12:30:00")
        );
        assert_eq!(normalize_timestamp("not a date"), None);
        assert_eq!(normalize_timestamp("2020-13-01T12:30:00Z"), None);
        assert_eq!(normalize_timestamp(""), None);
    }

    #[test]
    fn test_parse_naive_timestamp_accepts_both_separators() {
        let expected = parse_naive_timestamp("2020-03-01 00:00:00");
        assert!(expected.is_some());
        assert_eq!(parse_naive_timestamp("2020-03-01T00:00:00"), expected);
        assert_eq!(parse_naive_timestamp("/Date(1583020800000+0000)/"), None);
    }

    #[test]
    fn test_extract_skus_in_first_appearance_order() {
        let body = "Hi,\nI ordered ABCD1234-001 and XYZ98765-020\nABCD1234-001 arrived broken";
        assert_eq!(extract_skus(body), vec!["ABCD1234-001", "XYZ98765-020"]);
    }

    #[test]
    fn test_extract_skus_without_match() {
        assert!(extract_skus("nothing to see here").is_empty());
        assert!(extract_skus("abcd1234-001 lowercase").is_empty());
        assert!(extract_skus("").is_empty());
    }

    #[test]
    fn test_normalize_reference_id() {
        assert_eq!(normalize_reference_id(None), 0);
        assert_eq!(normalize_reference_id(Some(&Value::Null)), 0);
        assert_eq!(normalize_reference_id(Some(&json!(42))), 42);
        assert_eq!(normalize_reference_id(Some(&json!(42.0))), 42);
        assert_eq!(normalize_reference_id(Some(&json!("17"))), 17);
        assert_eq!(normalize_reference_id(Some(&json!({"id": 9, "name": "x"}))), 9);
        assert_eq!(normalize_reference_id(Some(&json!("n/a"))), 0);
    }

    #[test]
    fn test_text_rendering() {
        assert_eq!(text(None), "");
        assert_eq!(text(Some(&Value::Null)), "");
        assert_eq!(text(Some(&json!("open"))), "open");
        assert_eq!(text(Some(&json!(true))), "true");
        assert_eq!(text(Some(&json!(12))), "12");
    }
}
