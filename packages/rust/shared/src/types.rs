//! Core domain types for Newsloom content, generator output, and jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{NewsloomError, Result};

// ---------------------------------------------------------------------------
// ContentItem
// ---------------------------------------------------------------------------

/// A unit of fetched content, keyed by a stable content identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Stable, content-derived identifier. Items without one are never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    /// Name of the source that produced the item.
    pub source: String,
    /// Item kind (e.g. `discordRawData`, `githubIssue`).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// When the content was published upstream.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata; enrichers add keys here.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ContentItem {
    /// Create an item with a derived content id.
    pub fn new(
        source: impl Into<String>,
        kind: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let source = source.into();
        let text = text.into();
        let content_id = Self::derive_content_id(&source, None, &text);
        Self {
            content_id: Some(content_id),
            source,
            kind: kind.into(),
            title: None,
            text: Some(text),
            link: None,
            timestamp,
            metadata: BTreeMap::new(),
        }
    }

    /// SHA-256 over source, link and text. Stable across runs, so refetching
    /// the same upstream content yields the same id.
    pub fn derive_content_id(source: &str, link: Option<&str>, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(link.unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Generator output
// ---------------------------------------------------------------------------

/// Persisted generator output. Opaque to the orchestration core beyond
/// being handed to dependents as upstream context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Name of the generator that produced this item.
    pub generator: String,
    /// The day this summary covers.
    pub date: NaiveDate,
    /// Structured body (categories, stats, etc.).
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown: Option<String>,
}

/// A file a generator wants written under the run's output root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutput {
    /// Path relative to the output root. Must not escape it.
    pub relative_path: String,
    pub content: String,
}

/// Context handed to every generator invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorContext {
    /// Regenerate even if output for the date already exists.
    pub force: bool,
    /// The predecessor's summaries, set only when it succeeded with output.
    pub upstream_summaries: Option<Vec<SummaryItem>>,
    /// Tokens still available in this run, if the run is budgeted.
    pub token_budget: Option<i64>,
}

/// Token and cost accounting reported by a generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorStats {
    pub tokens_used: u64,
    pub estimated_cost_usd: f64,
}

/// Outcome of a single generator invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorResult {
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub summary_items: Vec<SummaryItem>,
    #[serde(default)]
    pub file_outputs: Vec<FileOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<GeneratorStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GeneratorResult {
    /// A successful result carrying summary items.
    pub fn succeeded(summary_items: Vec<SummaryItem>) -> Self {
        Self {
            success: true,
            summary_items,
            ..Self::default()
        }
    }

    /// A successful no-op (e.g. output already exists and `force` is off).
    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            ..Self::default()
        }
    }

    /// A failed result with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach file outputs.
    pub fn with_files(mut self, files: Vec<FileOutput>) -> Self {
        self.file_outputs = files;
        self
    }

    /// Attach usage stats.
    pub fn with_stats(mut self, tokens_used: u64, estimated_cost_usd: f64) -> Self {
        self.stats = Some(GeneratorStats {
            tokens_used,
            estimated_cost_usd,
        });
        self
    }

    /// Tokens consumed, zero when unreported.
    pub fn tokens_used(&self) -> u64 {
        self.stats.map(|s| s.tokens_used).unwrap_or(0)
    }

    /// Estimated cost, zero when unreported.
    pub fn estimated_cost_usd(&self) -> f64 {
        self.stats.map(|s| s.estimated_cost_usd).unwrap_or(0.0)
    }
}

/// Outcome of an exporter invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    pub success: bool,
    #[serde(default)]
    pub files_written: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            files_written: Vec::new(),
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Whether a job runs once or keeps ticking until stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    OneTime,
    Continuous,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneTime => "one-time",
            Self::Continuous => "continuous",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = NewsloomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "one-time" => Ok(Self::OneTime),
            "continuous" => Ok(Self::Continuous),
            other => Err(NewsloomError::validation(format!("unknown job type '{other}'"))),
        }
    }
}

/// Job lifecycle status. `Completed`, `Failed` and `Cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = NewsloomError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(NewsloomError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Usage produced by one continuous tick (or one whole one-time run).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TickUsage {
    pub items_fetched: u64,
    pub tokens_used: u64,
    pub estimated_cost_usd: f64,
}

impl TickUsage {
    pub fn is_empty(&self) -> bool {
        self.items_fetched == 0 && self.tokens_used == 0 && self.estimated_cost_usd == 0.0
    }
}

/// Accumulated usage for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub items_fetched: u64,
    pub tokens_used: u64,
    pub estimated_cost_usd: f64,
    /// Number of continuous ticks recorded.
    pub ticks: u64,
}

impl UsageTotals {
    /// Fold one tick into the totals.
    pub fn record(&mut self, usage: &TickUsage) {
        self.items_fetched += usage.items_fetched;
        self.tokens_used += usage.tokens_used;
        self.estimated_cost_usd += usage.estimated_cost_usd;
        self.ticks += 1;
    }

    /// Fold usage in without counting a tick.
    pub fn absorb(&mut self, usage: &TickUsage) {
        self.items_fetched += usage.items_fetched;
        self.tokens_used += usage.tokens_used;
        self.estimated_cost_usd += usage.estimated_cost_usd;
    }
}

/// Severity of a job log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One line of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl JobLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}

/// Persisted job record. Runtime task handles never live here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Name of the pipeline configuration the job runs.
    pub config_name: String,
    pub job_type: JobType,
    pub status: JobStatus,
    /// 0..=100.
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub usage: UsageTotals,
    #[serde(default)]
    pub logs: Vec<JobLogEntry>,
}

impl JobRecord {
    /// A fresh `Pending` record.
    pub fn pending(id: JobId, config_name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id,
            config_name: config_name.into(),
            job_type,
            status: JobStatus::Pending,
            progress: 0,
            start_time: Utc::now(),
            end_time: None,
            error: None,
            cancel_reason: None,
            usage: UsageTotals::default(),
            logs: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation status
// ---------------------------------------------------------------------------

/// Whether an engine is attached to a live job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// What the engine is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPhase {
    #[default]
    Idle,
    Fetching,
    Enriching,
    Generating,
}

/// Counters maintained by an engine across calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationStats {
    pub total_items_fetched: u64,
    pub items_per_source: BTreeMap<String, u64>,
    pub last_fetch_times: BTreeMap<String, DateTime<Utc>>,
}

/// An error recorded in the live status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Live snapshot of one engine. Overwritten in place, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationStatus {
    pub state: AggregationState,
    pub current_phase: AggregationPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_source: Option<String>,
    pub stats: AggregationStats,
    pub errors: Vec<StatusError>,
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Date selection for historical runs. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub during: Option<NaiveDate>,
}

impl DateFilter {
    /// A filter selecting exactly one day.
    pub fn on(date: NaiveDate) -> Self {
        Self {
            during: Some(date),
            ..Self::default()
        }
    }

    /// An inclusive `start..=end` filter.
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            after: Some(start),
            before: Some(end),
            during: None,
        }
    }

    /// First and last day selected by the filter.
    ///
    /// `after` + `before` form an inclusive range; any single bound selects
    /// that one day. `during` wins when combined with other bounds.
    pub fn bounds(&self) -> Result<(NaiveDate, NaiveDate)> {
        match (self.during, self.after, self.before) {
            (Some(day), _, _) => Ok((day, day)),
            (None, Some(start), Some(end)) if start > end => Err(NewsloomError::validation(
                format!("date range is inverted: after {start} is later than before {end}"),
            )),
            (None, Some(start), Some(end)) => Ok((start, end)),
            (None, Some(day), None) | (None, None, Some(day)) => Ok((day, day)),
            (None, None, None) => Err(NewsloomError::validation(
                "date filter needs at least one of after, before or during",
            )),
        }
    }

    /// Every day selected by the filter, in ascending order.
    pub fn dates(&self) -> Result<Vec<NaiveDate>> {
        let (start, end) = self.bounds()?;
        Ok(dates_inclusive(start, end))
    }
}

/// Calendar days from `start` to `end`, inclusive. Empty when inverted.
pub fn dates_inclusive(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("valid date")
    }

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let s = id.to_string();
        let parsed: JobId = s.parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn content_id_is_stable_and_source_scoped() {
        let a = ContentItem::derive_content_id("discord", None, "hello");
        let b = ContentItem::derive_content_id("discord", None, "hello");
        let c = ContentItem::derive_content_id("github", None, "hello");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn content_item_serializes_kind_as_type() {
        let item = ContentItem::new("github", "githubIssue", "bug report", Utc::now());
        let json = serde_json::to_value(&item).expect("serialize");
        assert_eq!(json["type"], "githubIssue");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert_eq!("cancelled".parse::<JobStatus>().unwrap(), JobStatus::Cancelled);
        assert_eq!("one-time".parse::<JobType>().unwrap(), JobType::OneTime);
    }

    #[test]
    fn usage_record_counts_ticks() {
        let mut totals = UsageTotals::default();
        totals.record(&TickUsage {
            items_fetched: 3,
            tokens_used: 10,
            estimated_cost_usd: 0.5,
        });
        totals.absorb(&TickUsage {
            items_fetched: 1,
            ..TickUsage::default()
        });
        assert_eq!(totals.items_fetched, 4);
        assert_eq!(totals.tokens_used, 10);
        assert_eq!(totals.ticks, 1);
    }

    #[test]
    fn date_filter_forms() {
        let range = DateFilter::between(day("2025-01-30"), day("2025-02-02"));
        assert_eq!(
            range.dates().unwrap(),
            vec![
                day("2025-01-30"),
                day("2025-01-31"),
                day("2025-02-01"),
                day("2025-02-02")
            ]
        );

        let single = DateFilter {
            before: Some(day("2025-03-01")),
            ..DateFilter::default()
        };
        assert_eq!(single.dates().unwrap(), vec![day("2025-03-01")]);

        assert_eq!(
            DateFilter::on(day("2025-03-05")).dates().unwrap(),
            vec![day("2025-03-05")]
        );
    }

    #[test]
    fn date_filter_rejects_inverted_and_empty() {
        let inverted = DateFilter::between(day("2025-02-02"), day("2025-01-30"));
        assert!(inverted.dates().is_err());
        assert!(DateFilter::default().dates().is_err());
    }

    #[test]
    fn generator_result_helpers() {
        let r = GeneratorResult::failed("boom");
        assert!(!r.success);
        assert_eq!(r.tokens_used(), 0);

        let r = GeneratorResult::succeeded(vec![]).with_stats(120, 0.02);
        assert!(r.success);
        assert_eq!(r.tokens_used(), 120);
    }
}
