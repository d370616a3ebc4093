use crate::domain::model::{CopyOptions, LoadPolicy, StagedObject, TargetTable};
use crate::domain::ports::Warehouse;
use crate::utils::error::{EtlError, Result};

pub struct Loader<'a, W: Warehouse> {
    warehouse: &'a W,
}

impl<'a, W: Warehouse> Loader<'a, W> {
    pub fn new(warehouse: &'a W) -> Self {
        Self { warehouse }
    }

    /// COPY a staged object according to the pipeline's load policy.
    ///
    /// Any warehouse failure is reported as [`EtlError::LoadError`] naming the staged key,
    /// which stays in the bucket for replay.
    pub async fn load(
        &self,
        policy: LoadPolicy,
        target: &TargetTable,
        staged: &StagedObject,
        options: &CopyOptions,
    ) -> Result<u64> {
        let replace = policy == LoadPolicy::FullRefresh;
        let rows = self
            .warehouse
            .copy_into(target, staged, options, replace)
            .await
            .map_err(|e| load_error(target, staged, e))?;

        tracing::info!(
            table = %target.table,
            key = %staged.key,
            rows,
            replace,
            "🚚 COPY finished"
        );

        if replace {
            // 資料已提交；維護失敗不影響已載入的資料，但仍回報
            self.warehouse.maintain(target).await.map_err(|e| EtlError::WarehouseError {
                table: target.table.clone(),
                message: format!("VACUUM/ANALYZE after full refresh failed: {}", e),
            })?;
        }

        Ok(rows)
    }

    pub async fn remove_duplicates(&self, target: &TargetTable) -> Result<u64> {
        let removed = self.warehouse.remove_duplicates(target).await?;
        if removed > 0 {
            tracing::warn!(
                table = %target.table,
                removed,
                "Removed duplicate uncategorised rows; overlapping windows were loaded"
            );
        }
        Ok(removed)
    }
}

fn load_error(target: &TargetTable, staged: &StagedObject, cause: EtlError) -> EtlError {
    match cause {
        already @ EtlError::LoadError { .. } => already,
        other => EtlError::LoadError {
            table: target.table.clone(),
            staged_key: staged.key.clone(),
            message: other.to_string(),
        },
    }
}
