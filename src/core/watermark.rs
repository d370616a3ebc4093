use crate::domain::model::{Category, LoadPolicy, RunStamp, TargetTable, Window};
use crate::domain::ports::Warehouse;
use crate::utils::error::Result;
use chrono::NaiveDateTime;

/// Turns the newest loaded timestamp of a category into the next extraction window.
pub struct WatermarkReader<'a, W: Warehouse> {
    warehouse: &'a W,
    floor: NaiveDateTime,
}

impl<'a, W: Warehouse> WatermarkReader<'a, W> {
    /// `floor` is the start of the very first (backfill) run of an empty table.
    pub fn new(warehouse: &'a W, floor: NaiveDateTime) -> Self {
        Self { warehouse, floor }
    }

    pub async fn window_for(
        &self,
        policy: LoadPolicy,
        target: &TargetTable,
        category: &Category,
        run: &RunStamp,
    ) -> Result<Window> {
        if policy == LoadPolicy::FullRefresh {
            return Ok(Window::until(run.started_at));
        }

        let window = match self.warehouse.max_timestamp(target, category).await? {
            Some(watermark) => {
                tracing::debug!(
                    table = %target.table,
                    category = %category,
                    "Watermark at {}",
                    watermark
                );
                Window::after_watermark(watermark, target.watermark_granularity, run.started_at)
            }
            None => {
                tracing::info!(
                    table = %target.table,
                    category = %category,
                    "No rows loaded yet, backfilling from {}",
                    self.floor
                );
                Window::new(self.floor, run.started_at)
            }
        };
        Ok(window)
    }
}
