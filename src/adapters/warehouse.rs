use crate::config::toml_config::WarehouseConfig;
use crate::core::sql::{self, CopyCredentials};
use crate::domain::model::{Category, CopyOptions, RunLease, StagedObject, TargetTable};
use crate::domain::ports::Warehouse;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Row};
use std::time::Duration;

fn on_table(table: &str) -> impl Fn(sqlx::Error) -> EtlError + '_ {
    move |e| EtlError::WarehouseError {
        table: table.to_string(),
        message: e.to_string(),
    }
}

/// Redshift over the Postgres wire protocol. Every statement goes through the simple query
/// protocol, which COPY and VACUUM require.
#[derive(Debug, Clone)]
pub struct RedshiftWarehouse {
    pool: PgPool,
    credentials: CopyCredentials,
    lock_table: String,
}

impl RedshiftWarehouse {
    pub fn new(pool: PgPool, credentials: CopyCredentials, lock_table: &str) -> Self {
        Self {
            pool,
            credentials,
            lock_table: lock_table.to_string(),
        }
    }

    /// 建立連線池並確保鎖表存在
    pub async fn connect(config: &WarehouseConfig, lock_table: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(2))
            .acquire_timeout(Duration::from_secs(
                config.connect_timeout_seconds.unwrap_or(30),
            ))
            .connect(&config.dsn)
            .await?;
        tracing::info!("🔌 Warehouse connection pool established");

        let warehouse = Self::new(pool, config.copy_credentials.clone(), lock_table);
        sqlx::raw_sql(&sql::create_lock_table(lock_table))
            .execute(&warehouse.pool)
            .await
            .map_err(on_table(lock_table))?;
        Ok(warehouse)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!("Warehouse connection pool closed");
    }
}

#[async_trait]
impl Warehouse for RedshiftWarehouse {
    async fn max_timestamp(
        &self,
        target: &TargetTable,
        category: &Category,
    ) -> Result<Option<NaiveDateTime>> {
        let query = sql::max_timestamp(target, category);
        tracing::debug!("{}", query);

        let row = self
            .pool
            .fetch_optional(sqlx::raw_sql(&query))
            .await
            .map_err(on_table(&target.table))?;
        match row {
            Some(row) => row
                .try_get::<Option<NaiveDateTime>, _>(0)
                .map_err(on_table(&target.table)),
            None => Ok(None),
        }
    }

    async fn copy_into(
        &self,
        target: &TargetTable,
        object: &StagedObject,
        options: &CopyOptions,
        replace: bool,
    ) -> Result<u64> {
        let copy = sql::copy(&target.table, &object.uri, options, &self.credentials);
        tracing::debug!(
            "{}",
            sql::copy_redacted(&target.table, &object.uri, options, &self.credentials)
        );

        let fail = on_table(&target.table);
        let mut tx = self.pool.begin().await.map_err(&fail)?;
        if replace {
            (&mut *tx)
                .execute(sqlx::raw_sql(&sql::delete_all(&target.table)))
                .await
                .map_err(&fail)?;
        }
        let loaded = (&mut *tx)
            .execute(sqlx::raw_sql(&copy))
            .await
            .map_err(&fail)?
            .rows_affected();
        tx.commit().await.map_err(&fail)?;
        Ok(loaded)
    }

    async fn maintain(&self, target: &TargetTable) -> Result<()> {
        for statement in [sql::vacuum(&target.table), sql::analyze(&target.table)] {
            sqlx::raw_sql(&statement)
                .execute(&self.pool)
                .await
                .map_err(on_table(&target.table))?;
        }
        Ok(())
    }

    async fn remove_duplicates(&self, target: &TargetTable) -> Result<u64> {
        let Some(statements) = sql::dedup_statements(target) else {
            return Ok(0);
        };

        let fail = on_table(&target.table);
        let mut tx = self.pool.begin().await.map_err(&fail)?;
        let mut removed = 0u64;
        for statement in statements.drop_shadowed.iter().chain([&statements.drop_stale]) {
            removed += (&mut *tx)
                .execute(sqlx::raw_sql(statement))
                .await
                .map_err(&fail)?
                .rows_affected();
        }

        (&mut *tx)
            .execute(sqlx::raw_sql(&statements.collect_copies))
            .await
            .map_err(&fail)?;
        let dropped = (&mut *tx)
            .execute(sqlx::raw_sql(&statements.drop_copies))
            .await
            .map_err(&fail)?
            .rows_affected();
        let restored = (&mut *tx)
            .execute(sqlx::raw_sql(&statements.restore_single))
            .await
            .map_err(&fail)?
            .rows_affected();
        (&mut *tx)
            .execute(sqlx::raw_sql(&statements.drop_scratch))
            .await
            .map_err(&fail)?;
        tx.commit().await.map_err(&fail)?;

        Ok(removed + dropped.saturating_sub(restored))
    }

    async fn try_acquire_lease(&self, lease: &RunLease) -> Result<Option<RunLease>> {
        let fail = on_table(&self.lock_table);
        let mut tx = self.pool.begin().await.map_err(&fail)?;

        (&mut *tx)
            .execute(sqlx::raw_sql(&sql::expire_leases(&self.lock_table, lease)))
            .await
            .map_err(&fail)?;
        let inserted = (&mut *tx)
            .execute(sqlx::raw_sql(&sql::insert_lease(&self.lock_table, lease)))
            .await
            .map_err(&fail)?
            .rows_affected();

        let current = if inserted == 1 {
            None
        } else {
            let row = (&mut *tx)
                .fetch_optional(sqlx::raw_sql(&sql::select_lease(
                    &self.lock_table,
                    &lease.pipeline,
                )))
                .await
                .map_err(&fail)?;
            let current = match row {
                Some(row) => RunLease {
                    pipeline: lease.pipeline.clone(),
                    holder: row.try_get("holder").map_err(&fail)?,
                    acquired_at: row.try_get("acquired_at").map_err(&fail)?,
                    expires_at: row.try_get("expires_at").map_err(&fail)?,
                },
                // 另一個執行剛好在兩個語句之間釋放了鎖
                None => RunLease {
                    holder: "unknown".to_string(),
                    ..lease.clone()
                },
            };
            Some(current)
        };

        tx.commit().await.map_err(&fail)?;
        Ok(current)
    }

    async fn release_lease(&self, lease: &RunLease) -> Result<()> {
        sqlx::raw_sql(&sql::release_lease(&self.lock_table, lease))
            .execute(&self.pool)
            .await
            .map_err(on_table(&self.lock_table))?;
        Ok(())
    }
}
