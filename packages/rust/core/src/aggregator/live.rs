//! Live call paths: fetch the sources' current batch.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use newsloom_shared::{ContentItem, Result};

use super::{AggregationEngine, BatchFetch, SourceHandle};

struct Current;

#[async_trait]
impl BatchFetch for Current {
    async fn fetch(&self, source: &SourceHandle) -> Result<Vec<ContentItem>> {
        source.fetch_items().await
    }
}

impl AggregationEngine {
    /// Fetch every source in registration order, then dedupe, enrich and
    /// persist the combined batch.
    ///
    /// One handler wraps the whole source loop: the first failing source
    /// aborts the remaining ones and the call returns an empty batch.
    #[instrument(skip_all, fields(sources = self.sources.len()))]
    pub async fn fetch_all(&self) -> Result<Vec<ContentItem>> {
        let items = self.run_all(&Current).await?;
        info!(new_items = items.len(), "fetch-all complete");
        Ok(items)
    }

    /// Fetch, dedupe and enrich a single source without persisting.
    ///
    /// Unknown names yield an empty batch. The source's own failure is
    /// recorded in the status and yields an empty batch.
    #[instrument(skip_all, fields(source = name))]
    pub async fn fetch_source(&self, name: &str) -> Result<Vec<ContentItem>> {
        let Some(source) = self.find_source(name) else {
            warn!(source = name, "no source registered under this name");
            return Ok(Vec::new());
        };
        self.run_single(source, &Current).await
    }

    /// [`fetch_source`](Self::fetch_source), then persist a non-empty
    /// result. Persistence failures are recorded in the status.
    pub async fn fetch_and_store(&self, name: &str) -> Result<Vec<ContentItem>> {
        let items = self.fetch_source(name).await?;
        self.store_batch(name, &items).await;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use newsloom_shared::{
        AggregationPhase, ContentStore, NewsloomError, Source, SummaryItem,
    };
    use newsloom_storage::MemoryStorage;

    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn fetch_all_persists_only_new_items() {
        let i1 = item("a", "one");
        let i2 = item("a", "two");
        let i3 = item("b", "three");

        let storage = Arc::new(MemoryStorage::new());
        storage.save_content_items(&[i1.clone()]).await.unwrap();

        let mut engine = AggregationEngine::new();
        engine.register_storage(storage.clone());
        engine.register_source(MockSource::new("a", vec![i1.clone(), i2.clone()]) as Arc<dyn Source>);
        engine.register_source(MockSource::new("b", vec![i3.clone()]) as Arc<dyn Source>);

        let fresh = engine.fetch_all().await.unwrap();
        assert_eq!(fresh, vec![i2.clone(), i3.clone()]);

        let stored = storage.content_items().await;
        assert_eq!(stored, vec![i1, i2, i3]);

        let status = engine.status();
        assert_eq!(status.stats.total_items_fetched, 2);
        assert_eq!(status.stats.items_per_source["a"], 1);
        assert_eq!(status.stats.items_per_source["b"], 1);
        assert_eq!(status.current_phase, AggregationPhase::Idle);
    }

    #[tokio::test]
    async fn fetch_all_aborts_remaining_sources_on_failure() {
        let failing = MockSource::failing("a");
        let later = MockSource::new("b", vec![item("b", "x")]);

        let storage = Arc::new(MemoryStorage::new());
        let mut engine = AggregationEngine::new();
        engine.register_storage(storage.clone());
        engine.register_source(failing.clone() as Arc<dyn Source>);
        engine.register_source(later.clone() as Arc<dyn Source>);

        let items = engine.fetch_all().await.unwrap();
        assert!(items.is_empty());
        assert_eq!(later.calls(), 0);
        assert!(storage.content_items().await.is_empty());

        let status = engine.status();
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].source.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn fetch_all_applies_enrichers_in_order() {
        let mut engine = AggregationEngine::new();
        engine.register_storage(Arc::new(MemoryStorage::new()));
        engine.register_source(MockSource::new("a", vec![item("a", "x")]) as Arc<dyn Source>);
        engine.register_enricher(Arc::new(TagEnricher("first")));
        engine.register_enricher(Arc::new(TagEnricher("second")));

        let items = engine.fetch_all().await.unwrap();
        assert_eq!(
            items[0].metadata["tags"],
            serde_json::json!(["first", "second"])
        );
    }

    #[tokio::test]
    async fn fetch_and_store_isolates_each_source() {
        let failing = MockSource::failing("a");
        let healthy = MockSource::new("b", vec![item("b", "x")]);

        let storage = Arc::new(MemoryStorage::new());
        let mut engine = AggregationEngine::new();
        engine.register_storage(storage.clone());
        engine.register_source(failing as Arc<dyn Source>);
        engine.register_source(healthy as Arc<dyn Source>);

        assert!(engine.fetch_and_store("a").await.unwrap().is_empty());
        assert_eq!(engine.fetch_and_store("b").await.unwrap().len(), 1);
        assert_eq!(storage.content_items().await.len(), 1);
        assert_eq!(engine.status().errors.len(), 1);
    }

    #[tokio::test]
    async fn fetch_source_does_not_persist() {
        let storage = Arc::new(MemoryStorage::new());
        let mut engine = AggregationEngine::new();
        engine.register_storage(storage.clone());
        engine.register_source(MockSource::new("a", vec![item("a", "x")]) as Arc<dyn Source>);

        assert_eq!(engine.fetch_source("a").await.unwrap().len(), 1);
        assert!(storage.content_items().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_source_yields_empty() {
        let mut engine = AggregationEngine::new();
        engine.register_storage(Arc::new(MemoryStorage::new()));
        assert!(engine.fetch_and_store("nope").await.unwrap().is_empty());
        assert!(engine.status().errors.is_empty());
    }

    /// Reads succeed, writes fail.
    struct ReadOnlyStore;

    #[async_trait]
    impl ContentStore for ReadOnlyStore {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        async fn get_content_item(&self, _content_id: &str) -> Result<Option<ContentItem>> {
            Ok(None)
        }
        async fn save_content_items(&self, _items: &[ContentItem]) -> Result<usize> {
            Err(NewsloomError::Storage("disk full".into()))
        }
        async fn save_summary_item(&self, _item: &SummaryItem) -> Result<()> {
            Err(NewsloomError::Storage("disk full".into()))
        }
    }

    #[tokio::test]
    async fn fetch_and_store_records_persistence_failures() {
        let mut engine = AggregationEngine::new();
        engine.register_storage(Arc::new(ReadOnlyStore));
        engine.register_source(MockSource::new("a", vec![item("a", "x")]) as Arc<dyn Source>);

        let items = engine.fetch_and_store("a").await.unwrap();
        assert_eq!(items.len(), 1);
        let errors = engine.status().errors;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("disk full"));

        // fetch_all treats the same failure as fatal.
        assert!(engine.fetch_all().await.is_err());
    }
}
