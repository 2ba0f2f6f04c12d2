//! Capability traits implemented by plugins and stores.
//!
//! The orchestration core only ever talks to these traits. Concrete
//! connectors, AI providers and databases live behind them.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::types::{
    ContentItem, ExportResult, GeneratorContext, GeneratorResult, JobId, JobLogEntry, JobRecord,
    SummaryItem, TickUsage,
};

// ---------------------------------------------------------------------------
// Pipeline plugins
// ---------------------------------------------------------------------------

/// Produces the current batch of content from some upstream.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_items(&self) -> Result<Vec<ContentItem>>;
}

/// A source that can also replay a past calendar day.
#[async_trait]
pub trait HistoricalSource: Source {
    async fn fetch_historical(&self, date: NaiveDate) -> Result<Vec<ContentItem>>;
}

/// Transforms a batch of items, usually by adding metadata.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn name(&self) -> &str;

    async fn enrich(&self, items: Vec<ContentItem>) -> Result<Vec<ContentItem>>;
}

/// Persistence for content and generator output.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn get_content_item(&self, content_id: &str) -> Result<Option<ContentItem>>;

    /// Upsert by `content_id`. Items without an id are ignored.
    /// Returns the number of rows written.
    async fn save_content_items(&self, items: &[ContentItem]) -> Result<usize>;

    async fn save_summary_item(&self, item: &SummaryItem) -> Result<()>;
}

/// Produces derived artifacts for one day, optionally building on a
/// single predecessor's output.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Name of the generator whose output this one consumes.
    fn depends_on(&self) -> Option<&str> {
        None
    }

    async fn generate(&self, date: NaiveDate, ctx: GeneratorContext) -> Result<GeneratorResult>;
}

/// Older generator shape that persists its own output and reports nothing.
#[async_trait]
pub trait LegacyGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate for "now" (continuous ticks).
    async fn generate_content(&self) -> Result<()>;

    /// Generate and persist the summary for a given day.
    async fn generate_and_store_summary(&self, date: NaiveDate) -> Result<()>;
}

/// Publishes already-generated output for a day.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, date: NaiveDate) -> Result<ExportResult>;
}

/// An AI provider handle. Opaque to the core; injected into plugins that
/// name it through `params.provider`.
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Persistence for job records.
///
/// `complete_job`, `fail_job` and `cancel_job` return whether the
/// transition happened. A record already in a terminal status is never
/// overwritten.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, record: &JobRecord) -> Result<()>;

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>>;

    /// All jobs, newest first.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;

    /// `Pending -> Running`.
    async fn start_job(&self, id: &JobId) -> Result<bool>;

    async fn update_job_progress(&self, id: &JobId, progress: u8) -> Result<()>;

    async fn complete_job(&self, id: &JobId) -> Result<bool>;

    async fn fail_job(&self, id: &JobId, error: &str) -> Result<bool>;

    async fn cancel_job(&self, id: &JobId, reason: &str) -> Result<bool>;

    async fn add_job_log(&self, id: &JobId, entry: &JobLogEntry) -> Result<()>;

    /// Jobs still `Pending` or `Running`.
    async fn get_running_jobs(&self) -> Result<Vec<JobRecord>>;

    /// Fold usage into the totals without counting a tick.
    async fn add_job_usage(&self, id: &JobId, usage: &TickUsage) -> Result<()>;

    /// Append one continuous tick and fold it into the totals.
    async fn record_continuous_tick(&self, id: &JobId, usage: &TickUsage) -> Result<()>;
}

/// Whether the owner of a job may keep consuming resources.
#[async_trait]
pub trait Entitlement: Send + Sync {
    async fn is_active(&self) -> bool;
}

/// Entitlement for local runs: always active.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysEntitled;

#[async_trait]
impl Entitlement for AlwaysEntitled {
    async fn is_active(&self) -> bool {
        true
    }
}
