//! Job lifecycle management.
//!
//! A job runs one pipeline configuration either once or continuously. The
//! [`JobManager`] owns every live job: it persists state through a
//! [`JobStore`], attaches an [`AggregationEngine`] to the job through the
//! [`EngineRegistry`], schedules repeating work in a per-job [`TaskSet`] and
//! publishes progress on the [`EventBus`].
//!
//! Terminal transitions go through one guarded path so each job ends
//! exactly once:
//!
//! | cause | status |
//! |---|---|
//! | run finished / user stop | `Completed` |
//! | entitlement lapsed | `Cancelled` |
//! | error or panic | `Failed` |

mod continuous;
mod events;
mod one_time;
mod recovery;
mod registry;
mod schedule;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use newsloom_shared::{
    AggregationState, AppConfig, DateFilter, Entitlement, GeneratorResult, JobId, JobLogEntry,
    JobRecord, JobStatus, JobStore, JobType, LogLevel, NewsloomError, PipelineConfig, Result,
    TickUsage, UsageTotals, expand_home,
};

use crate::aggregator::AggregationEngine;
use crate::plugins::{LoadedPipeline, PluginFactory};

pub use events::{
    AggregationSummary, ConfigSubscription, EventBus, JobStatusPayload, JobSubscription,
    StatusEvent,
};
pub use recovery::{
    CONTINUOUS_RESTART_REASON, ONE_TIME_RESTART_ERROR, RecoveryReport, sweep_stale_jobs,
};
pub use registry::{EngineLease, EngineRegistry};
pub use schedule::TaskSet;

/// Log line written when a user stops a job.
pub const STOPPED_BY_USER: &str = "stopped by user";

/// Cancel reason recorded when a tick finds the entitlement inactive.
pub const ENTITLEMENT_LAPSED: &str = "entitlement is no longer active";

// ---------------------------------------------------------------------------
// Settings and requests
// ---------------------------------------------------------------------------

/// Manager-wide knobs, usually taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// How long a finished one-time job's engine stays visible.
    pub engine_grace: Duration,
    /// Tick period for plugins without an interval of their own.
    pub default_interval: Duration,
    pub event_capacity: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            engine_grace: Duration::from_secs(5),
            default_interval: Duration::from_secs(3600),
            event_capacity: 256,
        }
    }
}

impl From<&AppConfig> for JobSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            engine_grace: Duration::from_millis(config.jobs.engine_grace_ms),
            default_interval: Duration::from_secs(config.defaults.interval_secs),
            event_capacity: config.jobs.event_capacity,
        }
    }
}

/// Options for a one-time run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub only_fetch: bool,
    pub only_generate: bool,
    pub output_path: Option<PathBuf>,
    pub force: bool,
    /// Replay these dates instead of fetching the current batch.
    pub historical: Option<DateFilter>,
    pub token_budget: Option<i64>,
}

/// Options for a continuous run.
#[derive(Debug, Clone, Default)]
pub struct ContinuousOptions {
    pub only_fetch: bool,
    pub only_generate: bool,
    pub output_path: Option<PathBuf>,
    pub force: bool,
    /// Shared budget across every generator tick of the job.
    pub token_budget: Option<i64>,
    /// One period for every task, overriding per-plugin intervals.
    pub global_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum JobMode {
    OneTime(RunOptions),
    Continuous(ContinuousOptions),
}

impl JobMode {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::OneTime(_) => JobType::OneTime,
            Self::Continuous(_) => JobType::Continuous,
        }
    }
}

/// Everything needed to start a job.
pub struct JobRequest {
    pub config: PipelineConfig,
    pub mode: JobMode,
    pub entitlement: Arc<dyn Entitlement>,
}

impl JobRequest {
    pub fn new(config: PipelineConfig, mode: JobMode) -> Self {
        Self {
            config,
            mode,
            entitlement: Arc::new(newsloom_shared::AlwaysEntitled),
        }
    }

    /// Mode and options as the configuration's `[settings]` describe them.
    pub fn from_config(config: PipelineConfig) -> Self {
        let s = &config.settings;
        let output_path = s.output_path.as_deref().map(expand_home);
        let mode = if s.run_once {
            JobMode::OneTime(RunOptions {
                only_fetch: s.only_fetch,
                only_generate: s.only_generate,
                output_path,
                force: s.force,
                historical: None,
                token_budget: s.token_budget,
            })
        } else {
            JobMode::Continuous(ContinuousOptions {
                only_fetch: s.only_fetch,
                only_generate: s.only_generate,
                output_path,
                force: s.force,
                token_budget: s.token_budget,
                global_interval: s.global_interval_secs.map(Duration::from_secs),
            })
        };
        Self::new(config, mode)
    }

    pub fn with_entitlement(mut self, entitlement: Arc<dyn Entitlement>) -> Self {
        self.entitlement = entitlement;
        self
    }
}

// ---------------------------------------------------------------------------
// Live job state
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct JobSnapshot {
    status: JobStatus,
    progress: u8,
    error: Option<String>,
    cancel_reason: Option<String>,
    usage: UsageTotals,
    remaining_budget: Option<i64>,
    /// Latest result per generator, fed back as seeds on later ticks.
    last_results: HashMap<String, GeneratorResult>,
}

impl Default for JobSnapshot {
    fn default() -> Self {
        Self {
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            cancel_reason: None,
            usage: UsageTotals::default(),
            remaining_budget: None,
            last_results: HashMap::new(),
        }
    }
}

enum Outcome {
    Completed,
    Stopped,
    Failed(String),
    Cancelled(String),
}

impl Outcome {
    fn status(&self) -> JobStatus {
        match self {
            Self::Completed | Self::Stopped => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::Cancelled(_) => JobStatus::Cancelled,
        }
    }

    fn log_entry(&self) -> JobLogEntry {
        match self {
            Self::Completed => JobLogEntry::info("Job completed"),
            Self::Stopped => JobLogEntry::info(format!("Job {STOPPED_BY_USER}")),
            Self::Failed(e) => JobLogEntry::error(format!("Job failed: {e}")),
            Self::Cancelled(reason) => JobLogEntry::warn(format!("Job cancelled: {reason}")),
        }
    }
}

/// Runtime side of a job. Dropped once the job is terminal.
struct ActiveJob {
    id: JobId,
    config_name: String,
    job_type: JobType,
    start_time: DateTime<Utc>,
    entitlement: Arc<dyn Entitlement>,
    state: Mutex<JobSnapshot>,
    tasks: TaskSet,
    /// Held for the whole of every continuous tick and of a one-time run.
    /// Storages close only once it is free.
    tick_gate: tokio::sync::Mutex<()>,
    engine: Mutex<Option<Arc<AggregationEngine>>>,
    lease: Mutex<Option<Arc<EngineLease>>>,
    pipeline: Mutex<Option<Arc<LoadedPipeline>>>,
}

impl ActiveJob {
    fn new(record: &JobRecord, entitlement: Arc<dyn Entitlement>) -> Self {
        Self {
            id: record.id.clone(),
            config_name: record.config_name.clone(),
            job_type: record.job_type,
            start_time: record.start_time,
            entitlement,
            state: Mutex::new(JobSnapshot::default()),
            tasks: TaskSet::new(),
            tick_gate: tokio::sync::Mutex::new(()),
            engine: Mutex::new(None),
            lease: Mutex::new(None),
            pipeline: Mutex::new(None),
        }
    }

    fn is_finished(&self) -> bool {
        lock(&self.state).status.is_terminal()
    }

    fn engine(&self) -> Option<Arc<AggregationEngine>> {
        lock(&self.engine).clone()
    }

    /// Move to a terminal status unless already there.
    fn try_finish(&self, outcome: &Outcome) -> bool {
        let mut state = lock(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        state.status = outcome.status();
        match outcome {
            Outcome::Completed | Outcome::Stopped => {}
            Outcome::Failed(e) => state.error = Some(e.clone()),
            Outcome::Cancelled(reason) => state.cancel_reason = Some(reason.clone()),
        }
        true
    }

    fn payload(&self) -> JobStatusPayload {
        let aggregation_status = self
            .engine()
            .map(|engine| engine.status().into())
            .unwrap_or_default();
        let state = lock(&self.state);
        JobStatusPayload {
            job_id: self.id.clone(),
            config_name: self.config_name.clone(),
            job_type: self.job_type,
            start_time: self.start_time,
            status: state.status,
            progress: state.progress,
            error: state.error.clone(),
            cancel_reason: state.cancel_reason.clone(),
            usage: state.usage,
            aggregation_status,
        }
    }
}

fn payload_from_record(record: &JobRecord, aggregation_status: AggregationSummary) -> JobStatusPayload {
    JobStatusPayload {
        job_id: record.id.clone(),
        config_name: record.config_name.clone(),
        job_type: record.job_type,
        start_time: record.start_time,
        status: record.status,
        progress: record.progress,
        error: record.error.clone(),
        cancel_reason: record.cancel_reason.clone(),
        usage: record.usage,
        aggregation_status,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates, runs, stops and reports on jobs.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    factory: PluginFactory,
    engines: EngineRegistry,
    events: EventBus,
    settings: JobSettings,
    active: tokio::sync::Mutex<HashMap<JobId, Arc<ActiveJob>>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, factory: PluginFactory, settings: JobSettings) -> Self {
        Self {
            store,
            factory,
            engines: EngineRegistry::new(),
            events: EventBus::new(settings.event_capacity),
            settings,
            active: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Share an engine registry with other managers or status readers.
    pub fn with_engine_registry(mut self, engines: EngineRegistry) -> Self {
        self.engines = engines;
        self
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn subscribe_job(&self, id: &JobId) -> JobSubscription {
        self.events.subscribe_job(id.clone())
    }

    pub fn subscribe_config(&self, config_name: &str) -> ConfigSubscription {
        self.events.subscribe_config(config_name)
    }

    /// Persist a pending job and start it in the background.
    #[instrument(skip_all, fields(config = %request.config.name))]
    pub async fn create_job(self: &Arc<Self>, request: JobRequest) -> Result<JobId> {
        let JobRequest {
            config,
            mode,
            entitlement,
        } = request;

        let id = JobId::new();
        let record = JobRecord::pending(id.clone(), config.name.clone(), mode.job_type());
        self.store.create_job(&record).await?;

        let job = Arc::new(ActiveJob::new(&record, entitlement));
        self.active.lock().await.insert(id.clone(), job.clone());
        info!(job_id = %id, job_type = record.job_type.as_str(), "job created");
        self.publish(&job);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let worker = tokio::spawn(manager.clone().execute(job.clone(), config, mode));
            let message = match worker.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) if e.is_panic() => {
                    format!("job task panicked: {}", panic_message(e.into_panic()))
                }
                Err(e) => format!("job task aborted: {e}"),
            };
            error!(job_id = %job.id, error = %message, "job failed");
            manager.finish(&job, Outcome::Failed(message)).await;
        });

        Ok(id)
    }

    async fn execute(
        self: Arc<Self>,
        job: Arc<ActiveJob>,
        config: PipelineConfig,
        mode: JobMode,
    ) -> Result<()> {
        match mode {
            JobMode::OneTime(options) => {
                let _gate = job.tick_gate.lock().await;
                self.run_one_time(&job, config, options).await
            }
            JobMode::Continuous(options) => self.run_continuous(&job, config, options).await,
        }
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.store.get_job(id).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.store.list_jobs().await
    }

    /// Live payload for an active job, otherwise one rebuilt from storage.
    pub async fn get_job_status(&self, id: &JobId) -> Result<Option<JobStatusPayload>> {
        let active = self.active.lock().await.get(id).cloned();
        if let Some(job) = active {
            return Ok(Some(job.payload()));
        }
        let Some(record) = self.store.get_job(id).await? else {
            return Ok(None);
        };
        let aggregation = self
            .engines
            .get(&record.config_name)
            .await
            .map(|engine| engine.status().into())
            .unwrap_or_default();
        Ok(Some(payload_from_record(&record, aggregation)))
    }

    /// Ids of jobs this manager is running, oldest first.
    pub async fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.active.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop a job: no further ticks, engine released, `Completed`.
    ///
    /// Returns `false` when the job had already ended.
    #[instrument(skip(self))]
    pub async fn stop_job(&self, id: &JobId) -> Result<bool> {
        let active = self.active.lock().await.get(id).cloned();
        if let Some(job) = active {
            return Ok(self.finish(&job, Outcome::Stopped).await);
        }

        let record = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| NewsloomError::NotFound(format!("job {id}")))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        // Not running in this process; settle the record only.
        let stopped = self.store.complete_job(id).await?;
        if stopped {
            self.store
                .add_job_log(id, &Outcome::Stopped.log_entry())
                .await?;
        }
        Ok(stopped)
    }

    /// Stop every job this manager is running.
    pub async fn stop_all(&self) -> usize {
        let jobs: Vec<Arc<ActiveJob>> = self.active.lock().await.values().cloned().collect();
        let mut stopped = 0;
        for job in jobs {
            if self.finish(&job, Outcome::Stopped).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Wait until the job reaches a terminal status and return its record.
    pub async fn wait_for_job(&self, id: &JobId) -> Result<JobRecord> {
        let mut updates = self.subscribe_job(id);
        loop {
            let record = self
                .store
                .get_job(id)
                .await?
                .ok_or_else(|| NewsloomError::NotFound(format!("job {id}")))?;
            if record.status.is_terminal() || updates.recv().await.is_none() {
                return Ok(record);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared steps
    // -----------------------------------------------------------------------

    fn publish(&self, job: &ActiveJob) {
        self.events.publish(StatusEvent::JobStatusUpdate(job.payload()));
    }

    /// Append to the job's log trail and mirror it to tracing.
    async fn log(&self, job: &ActiveJob, entry: JobLogEntry) {
        match entry.level {
            LogLevel::Info => info!(job_id = %job.id, "{}", entry.message),
            LogLevel::Warn => warn!(job_id = %job.id, "{}", entry.message),
            LogLevel::Error => error!(job_id = %job.id, "{}", entry.message),
        }
        if let Err(e) = self.store.add_job_log(&job.id, &entry).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job log entry");
        }
    }

    /// `Pending` → `Running`. `false` when the job ended before starting.
    async fn mark_running(&self, job: &ActiveJob) -> Result<bool> {
        if job.is_finished() {
            return Ok(false);
        }
        if !self.store.start_job(&job.id).await? {
            return Ok(false);
        }
        {
            let mut state = lock(&job.state);
            if state.status.is_terminal() {
                return Ok(false);
            }
            state.status = JobStatus::Running;
        }
        self.publish(job);
        Ok(true)
    }

    async fn set_progress(&self, job: &ActiveJob, done: usize, total: usize) {
        let progress = ((done * 100) / total.max(1)).min(100) as u8;
        lock(&job.state).progress = progress;
        if let Err(e) = self.store.update_job_progress(&job.id, progress).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job progress");
        }
        self.publish(job);
    }

    /// Fold a whole run's usage into the job.
    async fn add_usage(&self, job: &ActiveJob, usage: TickUsage) {
        lock(&job.state).usage.absorb(&usage);
        if let Err(e) = self.store.add_job_usage(&job.id, &usage).await {
            warn!(job_id = %job.id, error = %e, "failed to persist job usage");
        }
        self.publish(job);
    }

    /// Record one continuous tick's usage.
    async fn record_tick(&self, job: &ActiveJob, usage: TickUsage) {
        lock(&job.state).usage.record(&usage);
        if let Err(e) = self.store.record_continuous_tick(&job.id, &usage).await {
            warn!(job_id = %job.id, error = %e, "failed to persist tick usage");
        }
        self.publish(job);
    }

    /// Init storages, build the engine and install it for this job.
    ///
    /// `None` when the job was stopped while this ran; everything acquired
    /// here has been given back in that case.
    async fn attach(
        &self,
        job: &Arc<ActiveJob>,
        pipeline: LoadedPipeline,
    ) -> Result<Option<(Arc<LoadedPipeline>, Arc<AggregationEngine>)>> {
        if let Err(e) = pipeline.init_storages().await {
            pipeline.close_storages().await;
            return Err(e);
        }
        let pipeline = Arc::new(pipeline);
        let engine = Arc::new(pipeline.build_engine());
        engine.set_state(AggregationState::Running);
        let lease = Arc::new(self.engines.install(&job.config_name, engine.clone()).await);

        *lock(&job.pipeline) = Some(pipeline.clone());
        *lock(&job.engine) = Some(engine.clone());
        *lock(&job.lease) = Some(lease);
        self.forward_status(job, &engine);

        if job.is_finished() {
            self.release_resources(job).await;
            return Ok(None);
        }
        Ok(Some((pipeline, engine)))
    }

    /// Republish engine status changes until the job's tasks are cancelled.
    fn forward_status(&self, job: &ActiveJob, engine: &AggregationEngine) {
        let mut status = engine.watch_status();
        let events = self.events.clone();
        let config_name = job.config_name.clone();
        let token = job.tasks.token();
        job.tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = status.borrow_and_update().clone();
                        events.publish(StatusEvent::StatusUpdate {
                            config_name: config_name.clone(),
                            status: snapshot,
                        });
                    }
                }
            }
        });
    }

    /// Give back the engine lease, then close the job's storages once any
    /// in-flight work has drained.
    ///
    /// The close runs in its own task: the caller may be holding the tick
    /// gate itself.
    async fn release_resources(&self, job: &Arc<ActiveJob>) {
        let lease = lock(&job.lease).take();
        if let Some(lease) = lease {
            match job.job_type {
                JobType::OneTime => {
                    lease.release_after(self.settings.engine_grace);
                }
                JobType::Continuous => {
                    lease.release().await;
                }
            }
        }
        let pipeline = lock(&job.pipeline).take();
        if let Some(pipeline) = pipeline {
            let job = Arc::clone(job);
            tokio::spawn(async move {
                let _gate = job.tick_gate.lock().await;
                pipeline.close_storages().await;
                debug!(job_id = %job.id, "job storages closed");
            });
        }
    }

    /// The single terminal transition. `false` if the job had already ended.
    async fn finish(&self, job: &Arc<ActiveJob>, outcome: Outcome) -> bool {
        if !job.try_finish(&outcome) {
            return false;
        }
        job.tasks.cancel_all();

        // Log first: a reader that sees the terminal status sees its reason.
        self.log(job, outcome.log_entry()).await;
        let stored = match &outcome {
            Outcome::Completed | Outcome::Stopped => self.store.complete_job(&job.id).await,
            Outcome::Failed(e) => self.store.fail_job(&job.id, e).await,
            Outcome::Cancelled(reason) => self.store.cancel_job(&job.id, reason).await,
        };
        if let Err(e) = stored {
            error!(job_id = %job.id, error = %e, "failed to persist terminal status");
        }

        if let Some(engine) = job.engine() {
            engine.set_state(AggregationState::Stopped);
            self.events.publish(StatusEvent::StatusUpdate {
                config_name: job.config_name.clone(),
                status: engine.status(),
            });
        }
        self.publish(job);
        self.release_resources(job).await;
        self.active.lock().await.remove(&job.id);
        true
    }
}

#[cfg(test)]
mod tests;
