//! Shared types, error model, capability traits and configuration for Newsloom.
//!
//! This crate is the foundation depended on by all other Newsloom crates.
//! It provides:
//! - [`NewsloomError`]: the unified error type
//! - Domain types ([`ContentItem`], [`GeneratorResult`], [`JobRecord`], [`DateFilter`])
//! - Capability traits ([`Source`], [`Generator`], [`ContentStore`], [`JobStore`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod capability;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use capability::{
    AiProvider, AlwaysEntitled, ContentStore, Enricher, Entitlement, Exporter, Generator,
    HistoricalSource, JobStore, LegacyGenerator, Source,
};
pub use config::{
    AppConfig, DefaultsConfig, JobsConfig, PipelineConfig, PipelineSettings, PluginSpec,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    load_pipeline_config_from, parse_pipeline_config,
};
pub use error::{NewsloomError, Result};
pub use types::{
    AggregationPhase, AggregationState, AggregationStats, AggregationStatus, ContentItem,
    DateFilter, ExportResult, FileOutput, GeneratorContext, GeneratorResult, GeneratorStats,
    JobId, JobLogEntry, JobRecord, JobStatus, JobType, LogLevel, StatusError, SummaryItem,
    TickUsage, UsageTotals, dates_inclusive,
};
