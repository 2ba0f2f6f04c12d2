//! Aggregation engine: fetch → dedupe → enrich → persist.
//!
//! Two call paths exist on purpose and behave differently on failure:
//!
//! - [`AggregationEngine::fetch_all`] wraps the whole source loop in one
//!   handler. The first failing source aborts the remaining sources for that
//!   call and the call yields an empty batch.
//! - [`AggregationEngine::fetch_source`] / [`AggregationEngine::fetch_and_store`]
//!   isolate a single source. Its failure is recorded in the status and
//!   never affects other sources.
//!
//! Historical variants of both live in [`historical`] and only reach
//! sources loaded as [`HistoricalSource`].

mod historical;
mod live;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use newsloom_shared::{
    AggregationPhase, AggregationState, AggregationStatus, ContentItem, ContentStore, Enricher,
    HistoricalSource, NewsloomError, Result, Source, StatusError,
};

/// Oldest errors are dropped past this many.
const MAX_STATUS_ERRORS: usize = 50;

// ---------------------------------------------------------------------------
// Source handle
// ---------------------------------------------------------------------------

/// A registered source, classified once at load time.
#[derive(Clone)]
pub enum SourceHandle {
    Live(Arc<dyn Source>),
    Historical(Arc<dyn HistoricalSource>),
}

impl SourceHandle {
    pub fn name(&self) -> &str {
        match self {
            Self::Live(s) => s.name(),
            Self::Historical(s) => s.name(),
        }
    }

    pub fn is_historical(&self) -> bool {
        matches!(self, Self::Historical(_))
    }

    pub fn as_historical(&self) -> Option<&Arc<dyn HistoricalSource>> {
        match self {
            Self::Historical(s) => Some(s),
            Self::Live(_) => None,
        }
    }

    pub async fn fetch_items(&self) -> Result<Vec<ContentItem>> {
        match self {
            Self::Live(s) => s.fetch_items().await,
            Self::Historical(s) => s.fetch_items().await,
        }
    }
}

impl From<Arc<dyn Source>> for SourceHandle {
    fn from(source: Arc<dyn Source>) -> Self {
        Self::Live(source)
    }
}

impl From<Arc<dyn HistoricalSource>> for SourceHandle {
    fn from(source: Arc<dyn HistoricalSource>) -> Self {
        Self::Historical(source)
    }
}

/// Anything that can serve a batch for one source call.
#[async_trait]
trait BatchFetch: Send + Sync {
    async fn fetch(&self, source: &SourceHandle) -> Result<Vec<ContentItem>>;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the content pipeline for one configuration and publishes a live
/// [`AggregationStatus`].
///
/// Registration takes `&mut self`; once the engine is shared behind an
/// `Arc` the plugin set is fixed.
pub struct AggregationEngine {
    sources: Vec<SourceHandle>,
    enrichers: Vec<Arc<dyn Enricher>>,
    storage: Option<Arc<dyn ContentStore>>,
    status: watch::Sender<AggregationStatus>,
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationEngine {
    pub fn new() -> Self {
        let (status, _) = watch::channel(AggregationStatus::default());
        Self {
            sources: Vec::new(),
            enrichers: Vec::new(),
            storage: None,
            status,
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_source(&mut self, source: impl Into<SourceHandle>) {
        let source = source.into();
        debug!(source = source.name(), historical = source.is_historical(), "registered source");
        self.sources.push(source);
    }

    pub fn register_enricher(&mut self, enricher: Arc<dyn Enricher>) {
        debug!(enricher = enricher.name(), "registered enricher");
        self.enrichers.push(enricher);
    }

    /// Set the active store. A second call replaces the first.
    pub fn register_storage(&mut self, storage: Arc<dyn ContentStore>) {
        if self.storage.is_some() {
            debug!("replacing previously registered storage");
        }
        self.storage = Some(storage);
    }

    pub fn sources(&self) -> &[SourceHandle] {
        &self.sources
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn storage(&self) -> Option<&Arc<dyn ContentStore>> {
        self.storage.as_ref()
    }

    fn find_source(&self, name: &str) -> Option<&SourceHandle> {
        self.sources.iter().find(|s| s.name() == name)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// A snapshot of the current status.
    pub fn status(&self) -> AggregationStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<AggregationStatus> {
        self.status.subscribe()
    }

    /// Set the phase from outside (the job manager marks `Generating`).
    pub fn set_phase(&self, phase: AggregationPhase) {
        self.status.send_modify(|s| s.current_phase = phase);
    }

    pub fn set_state(&self, state: AggregationState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn set_current_source(&self, source: Option<&str>) {
        self.status
            .send_modify(|s| s.current_source = source.map(str::to_string));
    }

    fn enter_idle(&self) {
        self.status.send_modify(|s| {
            s.current_phase = AggregationPhase::Idle;
            s.current_source = None;
        });
    }

    /// Append an error to the status, keeping the most recent ones.
    pub fn record_error(&self, source: Option<&str>, message: impl Into<String>) {
        let entry = StatusError {
            source: source.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
        };
        self.status.send_modify(|s| {
            s.errors.push(entry);
            if s.errors.len() > MAX_STATUS_ERRORS {
                let excess = s.errors.len() - MAX_STATUS_ERRORS;
                s.errors.drain(..excess);
            }
        });
    }

    fn record_fetched(&self, items: &[ContentItem]) {
        if items.is_empty() {
            return;
        }
        let now = Utc::now();
        self.status.send_modify(|s| {
            s.stats.total_items_fetched += items.len() as u64;
            for item in items {
                *s.stats
                    .items_per_source
                    .entry(item.source.clone())
                    .or_insert(0) += 1;
                s.stats.last_fetch_times.insert(item.source.clone(), now);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Shared pipeline steps
    // -----------------------------------------------------------------------

    /// Keep only items the store does not already hold.
    ///
    /// Items without a `content_id` are dropped. Repeats within the batch
    /// keep their first occurrence. Fails when no storage is registered.
    pub async fn process_items(&self, items: Vec<ContentItem>) -> Result<Vec<ContentItem>> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            NewsloomError::Storage("no storage registered with the aggregation engine".into())
        })?;

        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(items.len());
        let mut without_id = 0usize;

        for item in items {
            let Some(content_id) = item.content_id.clone() else {
                without_id += 1;
                continue;
            };
            if !seen.insert(content_id.clone()) {
                continue;
            }
            if storage.get_content_item(&content_id).await?.is_none() {
                fresh.push(item);
            }
        }

        if without_id > 0 {
            debug!(dropped = without_id, "dropped items without content_id");
        }
        Ok(fresh)
    }

    /// Run every enricher, in registration order, over the whole batch.
    async fn enrich(&self, mut items: Vec<ContentItem>) -> Result<Vec<ContentItem>> {
        if items.is_empty() || self.enrichers.is_empty() {
            return Ok(items);
        }
        self.set_phase(AggregationPhase::Enriching);
        for enricher in &self.enrichers {
            items = enricher.enrich(items).await.map_err(|e| {
                NewsloomError::Enrichment(format!("enricher '{}' failed: {e}", enricher.name()))
            })?;
        }
        Ok(items)
    }

    /// Dedupe then enrich one source's batch.
    ///
    /// Fetch and enrichment failures are recorded and yield an empty batch.
    /// Dedupe failures propagate.
    async fn run_single(
        &self,
        source: &SourceHandle,
        fetcher: &dyn BatchFetch,
    ) -> Result<Vec<ContentItem>> {
        let name = source.name().to_string();
        self.status.send_modify(|s| {
            s.current_phase = AggregationPhase::Fetching;
            s.current_source = Some(name.clone());
        });

        let fetched = match fetcher.fetch(source).await {
            Ok(items) => items,
            Err(e) => {
                warn!(source = %name, error = %e, "source fetch failed");
                self.record_error(Some(&name), e.to_string());
                self.enter_idle();
                return Ok(Vec::new());
            }
        };

        let fresh = match self.process_items(fetched).await {
            Ok(items) => items,
            Err(e) => {
                self.enter_idle();
                return Err(e);
            }
        };

        let result = match self.enrich(fresh).await {
            Ok(items) => {
                self.record_fetched(&items);
                items
            }
            Err(e) => {
                warn!(source = %name, error = %e, "enrichment failed");
                self.record_error(Some(&name), e.to_string());
                Vec::new()
            }
        };
        self.enter_idle();
        Ok(result)
    }

    /// Persist a single-source batch. Failures are recorded, not returned.
    async fn store_batch(&self, source: &str, items: &[ContentItem]) {
        if items.is_empty() {
            return;
        }
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        match storage.save_content_items(items).await {
            Ok(written) => debug!(source, written, "stored items"),
            Err(e) => {
                warn!(source, error = %e, "failed to store items");
                self.record_error(Some(source), format!("failed to store items: {e}"));
            }
        }
    }

    /// Fetch-all body shared by the live and historical variants.
    ///
    /// The first source failure aborts the rest. Fetch and enrichment
    /// failures are recorded and yield an empty batch; dedupe and
    /// persistence failures propagate.
    async fn run_all(&self, fetcher: &dyn BatchFetch) -> Result<Vec<ContentItem>> {
        self.set_phase(AggregationPhase::Fetching);

        let mut batch = Vec::new();
        for source in &self.sources {
            self.set_current_source(Some(source.name()));
            match fetcher.fetch(source).await {
                Ok(items) => batch.extend(items),
                Err(e) => {
                    warn!(source = source.name(), error = %e, "source failed, aborting fetch-all");
                    self.record_error(Some(source.name()), e.to_string());
                    self.enter_idle();
                    return Ok(Vec::new());
                }
            }
        }
        self.set_current_source(None);

        let outcome: Result<Vec<ContentItem>> = async {
            let fresh = self.process_items(batch).await?;
            let enriched = match self.enrich(fresh).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "enrichment failed, dropping batch");
                    self.record_error(None, e.to_string());
                    return Ok(Vec::new());
                }
            };
            if !enriched.is_empty() {
                let storage = self.storage.as_ref().ok_or_else(|| {
                    NewsloomError::Storage("no storage registered with the aggregation engine".into())
                })?;
                storage.save_content_items(&enriched).await?;
            }
            self.record_fetched(&enriched);
            Ok(enriched)
        }
        .await;

        self.enter_idle();
        outcome
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Mock plugins shared by aggregator and job tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    use super::*;

    pub fn item(source: &str, text: &str) -> ContentItem {
        let ts: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        ContentItem::new(source, "testItem", text, ts)
    }

    /// Returns a fixed batch (or an error) and counts calls.
    pub struct MockSource {
        pub name: String,
        pub items: Vec<ContentItem>,
        pub fail: bool,
        pub calls: AtomicUsize,
        pub historical_calls: std::sync::Mutex<Vec<NaiveDate>>,
    }

    impl MockSource {
        pub fn new(name: &str, items: Vec<ContentItem>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                items,
                fail: false,
                calls: AtomicUsize::new(0),
                historical_calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        pub fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                items: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
                historical_calls: std::sync::Mutex::new(Vec::new()),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Source for MockSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch_items(&self) -> Result<Vec<ContentItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(NewsloomError::source(&self.name, "upstream unavailable"));
            }
            Ok(self.items.clone())
        }
    }

    #[async_trait]
    impl HistoricalSource for MockSource {
        async fn fetch_historical(&self, date: NaiveDate) -> Result<Vec<ContentItem>> {
            self.historical_calls.lock().unwrap().push(date);
            if self.fail {
                return Err(NewsloomError::source(&self.name, "archive unavailable"));
            }
            Ok(self
                .items
                .iter()
                .map(|i| {
                    let mut i = i.clone();
                    let text = format!("{}@{date}", i.text.clone().unwrap_or_default());
                    i.content_id = Some(ContentItem::derive_content_id(&i.source, None, &text));
                    i.text = Some(text);
                    i
                })
                .collect())
        }
    }

    /// Tags every item with its name.
    pub struct TagEnricher(pub &'static str);

    #[async_trait]
    impl Enricher for TagEnricher {
        fn name(&self) -> &str {
            self.0
        }

        async fn enrich(&self, mut items: Vec<ContentItem>) -> Result<Vec<ContentItem>> {
            for item in &mut items {
                let tags = item
                    .metadata
                    .entry("tags".into())
                    .or_insert_with(|| serde_json::json!([]));
                if let Some(arr) = tags.as_array_mut() {
                    arr.push(serde_json::json!(self.0));
                }
            }
            Ok(items)
        }
    }
}
