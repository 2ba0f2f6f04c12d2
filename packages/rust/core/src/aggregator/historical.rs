//! Historical call paths: replay past calendar days through the same
//! dedupe/enrich/persist pipeline.

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{error, info, instrument, warn};

use newsloom_shared::{ContentItem, DateFilter, Result};

use super::{AggregationEngine, BatchFetch, SourceHandle};

/// Fetches one day from historical sources and skips the rest.
struct OnDate(NaiveDate);

#[async_trait]
impl BatchFetch for OnDate {
    async fn fetch(&self, source: &SourceHandle) -> Result<Vec<ContentItem>> {
        match source.as_historical() {
            Some(historical) => historical.fetch_historical(self.0).await,
            None => {
                warn!(
                    source = source.name(),
                    date = %self.0,
                    "source has no historical support, skipping"
                );
                Ok(Vec::new())
            }
        }
    }
}

impl AggregationEngine {
    /// Historical counterpart of [`fetch_all`](Self::fetch_all) with the
    /// same abort-on-first-failure behavior.
    #[instrument(skip_all, fields(%date))]
    pub async fn fetch_all_for_date(&self, date: NaiveDate) -> Result<Vec<ContentItem>> {
        let items = self.run_all(&OnDate(date)).await?;
        info!(new_items = items.len(), "historical fetch-all complete");
        Ok(items)
    }

    /// Historical counterpart of [`fetch_source`](Self::fetch_source).
    pub async fn fetch_source_for_date(
        &self,
        name: &str,
        date: NaiveDate,
    ) -> Result<Vec<ContentItem>> {
        let Some(source) = self.find_source(name) else {
            warn!(source = name, "no source registered under this name");
            return Ok(Vec::new());
        };
        self.run_single(source, &OnDate(date)).await
    }

    /// Historical counterpart of [`fetch_and_store`](Self::fetch_and_store).
    pub async fn fetch_and_store_for_date(
        &self,
        name: &str,
        date: NaiveDate,
    ) -> Result<Vec<ContentItem>> {
        let items = self.fetch_source_for_date(name, date).await?;
        self.store_batch(name, &items).await;
        Ok(items)
    }

    /// Fetch and store one source for every day the filter selects, oldest
    /// first.
    ///
    /// An error on any day stops the remaining days. It is logged once
    /// here and the items gathered so far are returned. An unusable filter
    /// is an error.
    #[instrument(skip_all, fields(source = name))]
    pub async fn fetch_and_store_range(
        &self,
        name: &str,
        filter: &DateFilter,
    ) -> Result<Vec<ContentItem>> {
        let dates = filter.dates()?;
        let mut collected = Vec::new();

        for date in &dates {
            match self.fetch_and_store_for_date(name, *date).await {
                Ok(items) => collected.extend(items),
                Err(e) => {
                    error!(
                        source = name,
                        %date,
                        error = %e,
                        "historical range aborted"
                    );
                    self.record_error(
                        Some(name),
                        format!("historical range aborted at {date}: {e}"),
                    );
                    return Ok(collected);
                }
            }
        }

        info!(days = dates.len(), new_items = collected.len(), "historical range complete");
        Ok(collected)
    }
}
