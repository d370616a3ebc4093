#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use saas_etl::core::sql::CopyCredentials;
use saas_etl::domain::model::{
    Category, CopyOptions, LoadPolicy, PipelineSpec, RunLease, StageFormat, StagedObject,
    TargetTable, WatermarkGranularity, WAREHOUSE_TIMESTAMP_FORMAT,
};
use saas_etl::domain::ports::{ObjectStore, Warehouse};
use saas_etl::utils::error::{EtlError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type Row = Map<String, Value>;

pub fn at(day: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 3, day)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

pub fn stamp(t: NaiveDateTime) -> String {
    t.format(WAREHOUSE_TIMESTAMP_FORMAT).to_string()
}

#[derive(Default)]
struct StoreInner {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_uploads: AtomicBool,
}

/// Object store kept in memory; clones share the same objects.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.inner.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.objects.lock().unwrap().get(key).cloned()
    }
}

impl ObjectStore for MemoryStore {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        if self.inner.fail_uploads.load(Ordering::SeqCst) {
            return Err(EtlError::UploadError {
                key: key.to_string(),
                message: "bucket unavailable".to_string(),
            });
        }
        self.inner
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn object_uri(&self, key: &str) -> String {
        format!("mem://{}", key)
    }
}

#[derive(Default)]
struct WarehouseState {
    tables: HashMap<String, Vec<Row>>,
    leases: HashMap<String, RunLease>,
    copies: Vec<String>,
    maintained: usize,
    dedup_runs: usize,
}

/// Warehouse fake that follows the Redshift statements' semantics on in-memory rows.
#[derive(Clone)]
pub struct MemoryWarehouse {
    store: MemoryStore,
    state: Arc<Mutex<WarehouseState>>,
    csv_columns: Arc<Mutex<HashMap<String, Vec<String>>>>,
    fail_copies: Arc<AtomicBool>,
    lease_releases: Arc<AtomicUsize>,
}

impl MemoryWarehouse {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            state: Arc::default(),
            csv_columns: Arc::default(),
            fail_copies: Arc::default(),
            lease_releases: Arc::default(),
        }
    }

    /// Column order of a CSV-loaded table.
    pub fn with_csv_columns(self, table: &str, columns: &[&str]) -> Self {
        self.csv_columns.lock().unwrap().insert(
            table.to_string(),
            columns.iter().map(|c| c.to_string()).collect(),
        );
        self
    }

    pub fn fail_copies(&self, fail: bool) {
        self.fail_copies.store(fail, Ordering::SeqCst);
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        let target = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(row) = row {
                target.push(row);
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn copies(&self) -> Vec<String> {
        self.state.lock().unwrap().copies.clone()
    }

    pub fn maintained(&self) -> usize {
        self.state.lock().unwrap().maintained
    }

    pub fn dedup_runs(&self) -> usize {
        self.state.lock().unwrap().dedup_runs
    }

    pub fn leases(&self) -> Vec<RunLease> {
        self.state.lock().unwrap().leases.values().cloned().collect()
    }

    pub fn put_lease(&self, lease: RunLease) {
        self.state
            .lock()
            .unwrap()
            .leases
            .insert(lease.pipeline.clone(), lease);
    }

    pub fn lease_releases(&self) -> usize {
        self.lease_releases.load(Ordering::SeqCst)
    }

    fn parse_object(&self, table: &str, object: &StagedObject, format: StageFormat) -> Result<Vec<Row>> {
        let key = object.uri.trim_start_matches("mem://");
        let data = self.store.get(key).ok_or_else(|| EtlError::WarehouseError {
            table: table.to_string(),
            message: format!("S3ServiceException: The specified key does not exist: {}", key),
        })?;

        match format {
            StageFormat::Json => String::from_utf8_lossy(&data)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| serde_json::from_str::<Row>(l).map_err(EtlError::from))
                .collect(),
            StageFormat::Csv => {
                let columns = self
                    .csv_columns
                    .lock()
                    .unwrap()
                    .get(table)
                    .cloned()
                    .unwrap_or_default();
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(false)
                    .from_reader(data.as_slice());
                let mut rows = Vec::new();
                for record in reader.records() {
                    let record = record?;
                    let mut row = Row::new();
                    for (column, value) in columns.iter().zip(record.iter()) {
                        row.insert(column.clone(), Value::from(value));
                    }
                    rows.push(row);
                }
                Ok(rows)
            }
        }
    }
}

fn cell(row: &Row, column: &str) -> String {
    match row.get(column) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn in_category(row: &Row, target: &TargetTable, category: &Category) -> bool {
    let Some(column) = target.category_column.as_deref() else {
        return true;
    };
    match category {
        Category::All => true,
        Category::Uncategorised => cell(row, column).is_empty(),
        Category::Named(name) => cell(row, column) == *name,
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn max_timestamp(
        &self,
        target: &TargetTable,
        category: &Category,
    ) -> Result<Option<NaiveDateTime>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .get(&target.table)
            .into_iter()
            .flatten()
            .filter(|row| in_category(row, target, category))
            .filter_map(|row| {
                NaiveDateTime::parse_from_str(
                    &cell(row, &target.timestamp_column),
                    WAREHOUSE_TIMESTAMP_FORMAT,
                )
                .ok()
            })
            .max())
    }

    async fn copy_into(
        &self,
        target: &TargetTable,
        object: &StagedObject,
        options: &CopyOptions,
        replace: bool,
    ) -> Result<u64> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(EtlError::WarehouseError {
                table: target.table.clone(),
                message: "Load into table failed. Check 'stl_load_errors'".to_string(),
            });
        }
        let rows = self.parse_object(&target.table, object, options.format)?;

        let mut state = self.state.lock().unwrap();
        state.copies.push(object.key.clone());
        let table = state.tables.entry(target.table.clone()).or_default();
        if replace {
            table.clear();
        }
        let loaded = rows.len() as u64;
        table.extend(rows);
        Ok(loaded)
    }

    async fn maintain(&self, _target: &TargetTable) -> Result<()> {
        self.state.lock().unwrap().maintained += 1;
        Ok(())
    }

    async fn remove_duplicates(&self, target: &TargetTable) -> Result<u64> {
        let Some(key) = &target.key_column else {
            return Ok(0);
        };
        let category = target.category_column.clone();
        let mut state = self.state.lock().unwrap();
        state.dedup_runs += 1;
        let Some(rows) = state.tables.get_mut(&target.table) else {
            return Ok(0);
        };
        let before = rows.len();
        let uncategorised = |row: &Row| match &category {
            Some(column) => cell(row, column).is_empty(),
            None => true,
        };

        // shadowed by a categorised row
        let categorised_keys: Vec<String> = rows
            .iter()
            .filter(|r| !uncategorised(r))
            .map(|r| cell(r, key))
            .collect();
        rows.retain(|r| !(uncategorised(r) && categorised_keys.contains(&cell(r, key))));

        // stale copies
        let mut latest: HashMap<String, String> = HashMap::new();
        for row in rows.iter().filter(|r| uncategorised(r)) {
            let etl = cell(row, &target.etl_timestamp_column);
            let entry = latest.entry(cell(row, key)).or_default();
            if etl > *entry {
                *entry = etl;
            }
        }
        rows.retain(|r| {
            !uncategorised(r) || cell(r, &target.etl_timestamp_column) >= latest[&cell(r, key)]
        });

        // exact copies
        let mut seen: Vec<Row> = Vec::new();
        rows.retain(|r| {
            if !uncategorised(r) {
                return true;
            }
            if seen.contains(r) {
                false
            } else {
                seen.push(r.clone());
                true
            }
        });

        Ok((before - rows.len()) as u64)
    }

    async fn try_acquire_lease(&self, lease: &RunLease) -> Result<Option<RunLease>> {
        let mut state = self.state.lock().unwrap();
        if let Some(current) = state.leases.get(&lease.pipeline) {
            if current.expires_at > lease.acquired_at {
                return Ok(Some(current.clone()));
            }
        }
        state.leases.insert(lease.pipeline.clone(), lease.clone());
        Ok(None)
    }

    async fn release_lease(&self, lease: &RunLease) -> Result<()> {
        self.lease_releases.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state
            .leases
            .get(&lease.pipeline)
            .is_some_and(|current| current.holder == lease.holder)
        {
            state.leases.remove(&lease.pipeline);
        }
        Ok(())
    }
}

pub fn tickets_target() -> TargetTable {
    TargetTable {
        table: "zendesk.tickets".to_string(),
        timestamp_column: "created_at".to_string(),
        watermark_granularity: WatermarkGranularity::Second,
        category_column: Some("ticket_form".to_string()),
        key_column: Some("id".to_string()),
        etl_timestamp_column: "etl_tstamp".to_string(),
    }
}

pub fn tickets_spec(categories: Vec<Category>) -> PipelineSpec {
    PipelineSpec {
        name: "zendesk_tickets".to_string(),
        policy: LoadPolicy::Incremental,
        target: tickets_target(),
        categories,
        copy: CopyOptions {
            format: StageFormat::Json,
            json_paths_uri: None,
            accept_invalid_chars: true,
        },
        columns: None,
        key_prefix: String::new(),
        deduplicate: true,
    }
}

pub fn iam_role() -> CopyCredentials {
    CopyCredentials::IamRole {
        iam_role: "arn:aws:iam::123456789012:role/copy".to_string(),
    }
}
