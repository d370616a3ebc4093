use crate::domain::model::{Batch, Category, RunStamp, Window};
use crate::domain::ports::SourceApi;
use crate::utils::error::Result;

/// Pulls one category's records for a window and maps them; never writes anything.
pub struct WindowedExtractor<'a> {
    source: &'a dyn SourceApi,
}

impl<'a> WindowedExtractor<'a> {
    pub fn new(source: &'a dyn SourceApi) -> Self {
        Self { source }
    }

    pub async fn extract(
        &self,
        window: &Window,
        category: &Category,
        run: &RunStamp,
    ) -> Result<Batch> {
        let raw = self.source.list_created(window, category).await?;
        tracing::debug!(
            source = self.source.name(),
            category = %category,
            "Fetched {} raw records for {}",
            raw.len(),
            window
        );

        let mut records = Vec::with_capacity(raw.len());
        let mut skipped = 0;
        for item in &raw {
            for record in self.source.to_records(item, category, run)? {
                // API 端的時間過濾較粗，這裡以半開區間為準
                if window.contains(record.created_at) {
                    records.push(record);
                } else {
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            tracing::debug!(
                source = self.source.name(),
                category = %category,
                "Dropped {} records outside {}",
                skipped,
                window
            );
        }

        Ok(Batch {
            category: category.clone(),
            run: *run,
            window: *window,
            records,
            skipped,
        })
    }
}
