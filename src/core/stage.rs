use crate::domain::model::{Batch, Category, Record, RunStamp, StageFormat, StagedObject};
use crate::domain::ports::ObjectStore;
use crate::utils::error::{EtlError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Deterministic staging key: `{prefix}{YYYY_MM_DD}_{pipeline}[_{category}].{ext}`.
pub fn staging_key(
    prefix: &str,
    pipeline: &str,
    category: &Category,
    run: &RunStamp,
    format: StageFormat,
) -> String {
    let mut key = format!("{}{}_{}", prefix, run.file_date(), pipeline);
    if let Some(slug) = category.slug() {
        key.push('_');
        key.push_str(&slug);
    }
    key.push('.');
    key.push_str(format.extension());
    key
}

/// Serialise a batch the way COPY expects it: headerless CSV or one JSON object per line.
pub fn serialize_records(
    records: &[Record],
    format: StageFormat,
    columns: Option<&[String]>,
) -> Result<Vec<u8>> {
    match format {
        StageFormat::Json => {
            let mut out = Vec::new();
            for record in records {
                serde_json::to_writer(&mut out, &record.data)?;
                out.push(b'\n');
            }
            Ok(out)
        }
        StageFormat::Csv => {
            let discovered;
            let columns = match columns {
                Some(columns) => columns,
                None => {
                    discovered = batch_columns(records);
                    &discovered[..]
                }
            };
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(Vec::new());
            for record in records {
                let row: Vec<String> = columns
                    .iter()
                    .map(|c| csv_cell(record.data.get(c)))
                    .collect();
                writer.write_record(&row)?;
            }
            writer
                .into_inner()
                .map_err(|e| EtlError::IoError(e.into_error()))
        }
    }
}

/// 沒有指定欄位時，以整批出現過的欄位聯集為準（依首次出現順序），缺的欄位留空
fn batch_columns(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.data.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        // 巢狀值以 JSON 字串落地
        Some(other) => other.to_string(),
    }
}

/// Writes the local staging file, uploads it and removes it once the upload is confirmed.
pub struct Stager<'a, S: ObjectStore> {
    store: &'a S,
    staging_dir: PathBuf,
}

impl<'a, S: ObjectStore> Stager<'a, S> {
    pub fn new(store: &'a S, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn local_path(&self, key: &str) -> PathBuf {
        // key 可能含前綴目錄，本地只取檔名
        let file_name = Path::new(key)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| key.into());
        self.staging_dir.join(file_name)
    }

    pub async fn stage(
        &self,
        batch: &Batch,
        key: &str,
        format: StageFormat,
        columns: Option<&[String]>,
    ) -> Result<StagedObject> {
        let data = serialize_records(&batch.records, format, columns)?;
        let path = self.local_path(key);

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        tokio::fs::write(&path, &data).await?;
        tracing::debug!(key, path = %path.display(), bytes = data.len(), "Staging file written");

        if let Err(e) = self.store.put_object(key, &data).await {
            tracing::error!(key, path = %path.display(), "Upload failed, keeping local staging file");
            return Err(match e {
                upload @ EtlError::UploadError { .. } => upload,
                other => EtlError::UploadError {
                    key: key.to_string(),
                    message: other.to_string(),
                },
            });
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(path = %path.display(), "Uploaded but could not remove staging file: {}", e);
        }

        tracing::info!(key, records = batch.records.len(), "📦 Staged");
        Ok(StagedObject {
            key: key.to_string(),
            uri: self.store.object_uri(key),
            records: batch.records.len(),
        })
    }
}
