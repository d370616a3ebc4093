use crate::domain::model::{
    Category, CopyOptions, Record, RunLease, RunStamp, StagedObject, TargetTable, Window,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;

/// Key/value blob store the warehouse can COPY from.
pub trait ObjectStore: Send + Sync {
    fn put_object(
        &self,
        key: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Address the warehouse uses to read `key`, e.g. `s3://bucket/key`.
    fn object_uri(&self, key: &str) -> String;
}

/// Columnar warehouse fed by bulk COPY.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// 最大已載入時間；沒有任何列時回傳 `None`
    async fn max_timestamp(
        &self,
        target: &TargetTable,
        category: &Category,
    ) -> Result<Option<NaiveDateTime>>;

    /// COPY the staged object into the target. With `replace` the existing rows are deleted
    /// in the same transaction.
    async fn copy_into(
        &self,
        target: &TargetTable,
        object: &StagedObject,
        options: &CopyOptions,
        replace: bool,
    ) -> Result<u64>;

    /// VACUUM + ANALYZE.
    async fn maintain(&self, target: &TargetTable) -> Result<()>;

    /// Collapse uncategorised rows loaded more than once; returns rows removed.
    async fn remove_duplicates(&self, target: &TargetTable) -> Result<u64>;

    /// `Ok(None)` when the lease was taken; `Ok(Some(holder))` describes the current holder.
    async fn try_acquire_lease(&self, lease: &RunLease) -> Result<Option<RunLease>>;

    async fn release_lease(&self, lease: &RunLease) -> Result<()>;
}

/// One SaaS API the pipeline pulls from.
#[async_trait]
pub trait SourceApi: Send + Sync {
    fn name(&self) -> &str;

    /// Raw records created inside `window` for `category`, all pages, rate limited.
    async fn list_created(&self, window: &Window, category: &Category) -> Result<Vec<Value>>;

    /// Pure mapping of one raw record to target rows.
    fn to_records(&self, raw: &Value, category: &Category, run: &RunStamp) -> Result<Vec<Record>>;
}
