use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// 倉儲端的時間格式 (naive UTC)
pub const WAREHOUSE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One source entity flattened into target columns, in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub created_at: Option<NaiveDateTime>,
    pub data: Map<String, Value>,
}

impl Record {
    pub fn new(created_at: Option<NaiveDateTime>) -> Self {
        Self {
            created_at,
            data: Map::new(),
        }
    }

    pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
        self.data.insert(field.to_string(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// Half-open extraction window `[start, end)`. A missing start means "since the beginning".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: Option<NaiveDateTime>,
    pub end: NaiveDateTime,
}

impl Window {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end,
        }
    }

    pub fn until(end: NaiveDateTime) -> Self {
        Self { start: None, end }
    }

    /// 水位之後的第一個未載入時刻；只有日期的欄位則整天重讀
    pub fn after_watermark(
        watermark: NaiveDateTime,
        granularity: WatermarkGranularity,
        end: NaiveDateTime,
    ) -> Self {
        let start = match granularity {
            WatermarkGranularity::Second => watermark + Duration::seconds(1),
            WatermarkGranularity::Day => watermark.date().and_time(NaiveTime::MIN),
        };
        Self::new(start, end)
    }

    pub fn contains(&self, at: Option<NaiveDateTime>) -> bool {
        match (self.start, at) {
            (None, None) => true,
            (None, Some(t)) => t < self.end,
            (Some(_), None) => false,
            (Some(start), Some(t)) => start <= t && t < self.end,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.start, Some(start) if start >= self.end)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(
                f,
                "[{}, {})",
                start.format(WAREHOUSE_TIMESTAMP_FORMAT),
                self.end.format(WAREHOUSE_TIMESTAMP_FORMAT)
            ),
            None => write!(f, "[-, {})", self.end.format(WAREHOUSE_TIMESTAMP_FORMAT)),
        }
    }
}

/// Parallel stream a pipeline is split into; each keeps its own watermark and staging key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Category {
    /// Pipeline without a category column.
    All,
    /// Rows whose category column is empty (e.g. tickets submitted without a form).
    Uncategorised,
    Named(String),
}

impl Category {
    pub fn label(&self) -> &str {
        match self {
            Category::All => "all",
            Category::Uncategorised => "uncategorised",
            Category::Named(name) => name,
        }
    }

    /// Value written into the category column.
    pub fn tag(&self) -> &str {
        match self {
            Category::All | Category::Uncategorised => "",
            Category::Named(name) => name,
        }
    }

    /// 用於檔名：小寫英數，其餘轉成底線
    pub fn slug(&self) -> Option<String> {
        match self {
            Category::All => None,
            other => {
                let mut slug = String::new();
                for c in other.label().chars() {
                    if c.is_ascii_alphanumeric() {
                        slug.push(c.to_ascii_lowercase());
                    } else if !slug.ends_with('_') {
                        slug.push('_');
                    }
                }
                Some(slug.trim_matches('_').to_string())
            }
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Wall-clock start of a run; the upper bound of every window and the `etl_tstamp` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStamp {
    pub started_at: NaiveDateTime,
}

impl RunStamp {
    pub fn new(started_at: NaiveDateTime) -> Self {
        // 倉儲精度為秒
        let started_at = started_at
            .with_nanosecond(0)
            .unwrap_or(started_at);
        Self { started_at }
    }

    pub fn now() -> Self {
        Self::new(chrono::Utc::now().naive_utc())
    }

    pub fn etl_tstamp(&self) -> String {
        self.started_at.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string()
    }

    pub fn file_date(&self) -> String {
        self.started_at.format("%Y_%m_%d").to_string()
    }
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub category: Category,
    pub run: RunStamp,
    pub window: Window,
    pub records: Vec<Record>,
    /// Mapped records that fell outside the window.
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFormat {
    Csv,
    Json,
}

impl StageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            StageFormat::Csv => "csv",
            StageFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPolicy {
    /// DELETE everything, COPY, then VACUUM/ANALYZE.
    FullRefresh,
    /// COPY on top of what is there; window starts after the watermark.
    Incremental,
}

/// Precision of the values in a target's timestamp column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkGranularity {
    #[default]
    Second,
    /// Date-only column: rows entered later on the watermark day share its value, so the
    /// whole day is extracted again and the duplicate pass keeps one copy per key.
    Day,
}

/// An uploaded staging artifact the warehouse can COPY from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedObject {
    pub key: String,
    pub uri: String,
    pub records: usize,
}

/// Where and how a pipeline lands in the warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub table: String,
    pub timestamp_column: String,
    pub watermark_granularity: WatermarkGranularity,
    pub category_column: Option<String>,
    pub key_column: Option<String>,
    pub etl_timestamp_column: String,
}

/// COPY options that do not depend on the staged object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub format: StageFormat,
    /// S3 URI of a jsonpaths file; `None` means `JSON 'auto'`.
    pub json_paths_uri: Option<String>,
    pub accept_invalid_chars: bool,
}

/// Everything the engine needs to run one configured pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub name: String,
    pub policy: LoadPolicy,
    pub target: TargetTable,
    /// Processed in order; never empty.
    pub categories: Vec<Category>,
    pub copy: CopyOptions,
    /// CSV column order; JSON keeps the mapping's field order.
    pub columns: Option<Vec<String>>,
    pub key_prefix: String,
    pub deduplicate: bool,
}

/// Lease on the run lock table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLease {
    pub pipeline: String,
    pub holder: String,
    pub acquired_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: Category,
    pub window: Window,
    pub records: usize,
    pub staged_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub pipeline: String,
    pub categories: Vec<CategoryReport>,
    pub duplicates_removed: u64,
}

impl RunReport {
    pub fn records_loaded(&self) -> usize {
        self.categories
            .iter()
            .filter(|c| c.staged_key.is_some())
            .map(|c| c.records)
            .sum()
    }
}
