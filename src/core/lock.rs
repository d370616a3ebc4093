use crate::domain::model::{RunLease, WAREHOUSE_TIMESTAMP_FORMAT};
use crate::domain::ports::Warehouse;
use crate::utils::error::{EtlError, Result};
use chrono::{Duration, NaiveDateTime};

/// Identifies this process as a lease holder.
pub fn holder_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("AWS_LAMBDA_LOG_STREAM_NAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

pub fn lease_for(pipeline: &str, holder: &str, now: NaiveDateTime, lease: Duration) -> RunLease {
    RunLease {
        pipeline: pipeline.to_string(),
        holder: holder.to_string(),
        acquired_at: now,
        expires_at: now + lease,
    }
}

/// 取得執行鎖；已有人持有時回傳 LockHeldError
pub async fn acquire<W: Warehouse>(warehouse: &W, lease: &RunLease) -> Result<()> {
    match warehouse.try_acquire_lease(lease).await? {
        None => {
            tracing::debug!(pipeline = %lease.pipeline, holder = %lease.holder, "Run lease acquired");
            Ok(())
        }
        Some(current) => Err(EtlError::LockHeldError {
            pipeline: lease.pipeline.clone(),
            holder: current.holder,
            expires_at: current
                .expires_at
                .format(WAREHOUSE_TIMESTAMP_FORMAT)
                .to_string(),
        }),
    }
}

/// Release never fails the run: an unreleased lease simply expires.
pub async fn release<W: Warehouse>(warehouse: &W, lease: &RunLease) {
    if let Err(e) = warehouse.release_lease(lease).await {
        tracing::warn!(
            pipeline = %lease.pipeline,
            "Could not release run lease, it expires at {}: {}",
            lease.expires_at,
            e
        );
    }
}
