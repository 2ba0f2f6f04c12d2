//! Continuous execution: an initial pass, then one repeating task per
//! source and per generator until the job ends.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use newsloom_shared::{
    AggregationPhase, ContentStore, Generator, JobLogEntry, LegacyGenerator, PipelineConfig,
    Result, TickUsage,
};

use super::{ActiveJob, ContinuousOptions, ENTITLEMENT_LAPSED, JobManager, Outcome, lock};
use crate::aggregator::AggregationEngine;
use crate::generators::{RunGeneratorsOptions, run_generators_for_date};
use crate::plugins::{GeneratorHandle, load_pipeline};

/// Values every generator tick of one job shares.
struct TickContext {
    storage: Option<Arc<dyn ContentStore>>,
    output_path: Option<PathBuf>,
    force: bool,
}

impl JobManager {
    #[instrument(skip_all, fields(job_id = %job.id, config = %job.config_name))]
    pub(super) async fn run_continuous(
        self: &Arc<Self>,
        job: &Arc<ActiveJob>,
        config: PipelineConfig,
        options: ContinuousOptions,
    ) -> Result<()> {
        if !self.mark_running(job).await? {
            return Ok(());
        }

        self.log(job, JobLogEntry::info(format!("Loading configuration '{}'", config.name)))
            .await;
        let loaded = load_pipeline(&config, &self.factory)?;
        for warning in &loaded.warnings {
            self.log(job, JobLogEntry::warn(warning.to_string())).await;
        }
        let Some((pipeline, engine)) = self.attach(job, loaded).await? else {
            return Ok(());
        };

        lock(&job.state).remaining_budget = options.token_budget;
        let ctx = Arc::new(TickContext {
            storage: pipeline.primary_storage(),
            output_path: options.output_path.clone(),
            force: options.force,
        });
        let fetch = !options.only_generate;
        let generate = !options.only_fetch;

        // --- Initial pass ---
        {
            let _gate = job.tick_gate.lock().await;
            if !self.tick_admitted(job).await {
                return Ok(());
            }
            let mut usage = TickUsage::default();
            if fetch {
                for source in &pipeline.sources {
                    usage.items_fetched += self.fetch_once(job, &engine, &source.name).await;
                }
            }
            if generate {
                let generated = self
                    .generate_once(job, &engine, &ctx, pipeline.modern_generators())
                    .await;
                usage.tokens_used += generated.tokens_used;
                usage.estimated_cost_usd += generated.estimated_cost_usd;
                for legacy in pipeline.legacy_generators() {
                    self.legacy_once(job, &legacy).await;
                }
            }
            self.record_tick(job, usage).await;
        }
        if job.is_finished() {
            return Ok(());
        }

        // --- Schedule ---
        let mut scheduled = 0usize;
        if fetch {
            for source in &pipeline.sources {
                let period = self.tick_period(options.global_interval, source.interval_secs);
                let manager = Arc::clone(self);
                let job_ref = Arc::clone(job);
                let engine = engine.clone();
                let name = source.name.clone();
                job.tasks
                    .spawn_repeating(format!("source:{name}"), period, move || {
                        let manager = manager.clone();
                        let job = job_ref.clone();
                        let engine = engine.clone();
                        let name = name.clone();
                        async move { manager.source_tick(&job, &engine, &name).await }
                    });
                scheduled += 1;
            }
        }
        if generate {
            for generator in &pipeline.generators {
                let period = self.tick_period(options.global_interval, generator.interval_secs);
                let manager = Arc::clone(self);
                let job_ref = Arc::clone(job);
                let engine = engine.clone();
                let ctx = ctx.clone();
                let handle = generator.plugin.clone();
                job.tasks
                    .spawn_repeating(format!("generator:{}", generator.name), period, move || {
                        let manager = manager.clone();
                        let job = job_ref.clone();
                        let engine = engine.clone();
                        let ctx = ctx.clone();
                        let handle = handle.clone();
                        async move {
                            manager
                                .generator_tick(&job, &engine, &ctx, &handle)
                                .await
                        }
                    });
                scheduled += 1;
            }
        }

        self.log(
            job,
            JobLogEntry::info(format!("Scheduled {scheduled} repeating tasks")),
        )
        .await;
        Ok(())
    }

    fn tick_period(&self, global: Option<Duration>, own_secs: Option<u64>) -> Duration {
        global
            .or(own_secs.map(Duration::from_secs))
            .unwrap_or(self.settings.default_interval)
    }

    /// Whether a tick may run. Cancels the job when the entitlement has
    /// lapsed.
    async fn tick_admitted(&self, job: &Arc<ActiveJob>) -> bool {
        if job.is_finished() {
            return false;
        }
        if job.entitlement.is_active().await {
            return true;
        }
        self.finish(job, Outcome::Cancelled(ENTITLEMENT_LAPSED.to_string()))
            .await;
        false
    }

    async fn source_tick(&self, job: &Arc<ActiveJob>, engine: &AggregationEngine, name: &str) {
        let _gate = job.tick_gate.lock().await;
        if !self.tick_admitted(job).await {
            return;
        }
        let items_fetched = self.fetch_once(job, engine, name).await;
        self.record_tick(
            job,
            TickUsage {
                items_fetched,
                ..TickUsage::default()
            },
        )
        .await;
    }

    async fn generator_tick(
        &self,
        job: &Arc<ActiveJob>,
        engine: &AggregationEngine,
        ctx: &TickContext,
        handle: &GeneratorHandle,
    ) {
        let _gate = job.tick_gate.lock().await;
        if !self.tick_admitted(job).await {
            return;
        }
        let usage = match handle {
            GeneratorHandle::Modern(generator) => {
                self.generate_once(job, engine, ctx, vec![generator.clone()])
                    .await
            }
            GeneratorHandle::Legacy(generator) => {
                self.legacy_once(job, generator).await;
                TickUsage::default()
            }
        };
        self.record_tick(job, usage).await;
    }

    /// Fetch and store one source. Returns the number of new items.
    async fn fetch_once(&self, job: &ActiveJob, engine: &AggregationEngine, name: &str) -> u64 {
        match engine.fetch_and_store(name).await {
            Ok(items) => items.len() as u64,
            Err(e) => {
                self.log(job, JobLogEntry::error(format!("Fetch from '{name}' failed: {e}")))
                    .await;
                0
            }
        }
    }

    /// Run `generators` for today against the job's remaining budget.
    async fn generate_once(
        &self,
        job: &ActiveJob,
        engine: &AggregationEngine,
        ctx: &TickContext,
        generators: Vec<Arc<dyn Generator>>,
    ) -> TickUsage {
        if generators.is_empty() {
            return TickUsage::default();
        }
        let (budget, seed_results) = {
            let state = lock(&job.state);
            (state.remaining_budget, state.last_results.clone())
        };
        if budget.is_some_and(|left| left <= 0) {
            debug!(job_id = %job.id, "token budget exhausted, generator tick skipped");
            return TickUsage::default();
        }

        let options = RunGeneratorsOptions {
            generators,
            storage: ctx.storage.clone(),
            output_path: ctx.output_path.clone(),
            force: ctx.force,
            token_budget: budget,
            seed_results,
            on_complete: None,
        };
        engine.set_phase(AggregationPhase::Generating);
        let outcome = run_generators_for_date(Utc::now().date_naive(), &options).await;
        engine.set_phase(AggregationPhase::Idle);

        let run = match outcome {
            Ok(run) => run,
            Err(e) => {
                self.log(job, JobLogEntry::error(format!("Generation failed: {e}")))
                    .await;
                return TickUsage::default();
            }
        };

        {
            let mut state = lock(&job.state);
            state.remaining_budget = run.remaining_budget;
            state
                .last_results
                .extend(run.generator_results.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for failure in &run.errors {
            self.log(job, JobLogEntry::warn(format!("Generator error: {failure}")))
                .await;
        }
        if run.budget_exhausted {
            self.log(job, JobLogEntry::warn("Token budget exhausted")).await;
        }
        TickUsage {
            items_fetched: 0,
            tokens_used: run.total_tokens_used,
            estimated_cost_usd: run.total_estimated_cost_usd,
        }
    }

    async fn legacy_once(&self, job: &ActiveJob, generator: &Arc<dyn LegacyGenerator>) {
        if let Err(e) = generator.generate_content().await {
            self.log(
                job,
                JobLogEntry::warn(format!("Generator error: {}: {e}", generator.name())),
            )
            .await;
        }
    }
}
