//! Orchestration core for Newsloom.
//!
//! - [`aggregator`]: the fetch → dedupe → enrich → persist engine
//! - [`generators`]: dependency-ordered generator runs with a token budget
//! - [`plugins`]: turning a pipeline config into live plugin instances
//! - [`jobs`]: one-time and continuous jobs, status fan-out, restart recovery

pub mod aggregator;
pub mod builtin;
pub mod generators;
pub mod jobs;
pub mod plugins;

pub use aggregator::{AggregationEngine, SourceHandle};
pub use generators::{
    ExportRunResult, RunGeneratorsOptions, RunGeneratorsResult, run_exporters_for_date,
    run_exporters_for_range, run_generators_for_date, run_generators_for_range,
    run_legacy_generators_for_date, sort_by_depends_on,
};
pub use jobs::{
    ContinuousOptions, EngineRegistry, EventBus, JobManager, JobMode, JobRequest, JobSettings,
    JobStatusPayload, RecoveryReport, RunOptions, StatusEvent,
};
pub use plugins::{LoadWarning, LoadedPipeline, Plugin, PluginFactory, load_pipeline};
