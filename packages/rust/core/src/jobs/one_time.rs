//! One-time execution: fetch, generate, export, done.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::instrument;

use newsloom_shared::{
    AggregationPhase, GeneratorResult, JobLogEntry, PipelineConfig, Result, TickUsage,
    dates_inclusive,
};

use super::{ActiveJob, JobManager, Outcome, RunOptions, lock};
use crate::generators::{
    RunGeneratorsOptions, run_exporters_for_range, run_generators_for_range,
    run_legacy_generators_for_date,
};
use crate::plugins::load_pipeline;

impl JobManager {
    #[instrument(skip_all, fields(job_id = %job.id, config = %job.config_name))]
    pub(super) async fn run_one_time(
        &self,
        job: &Arc<ActiveJob>,
        config: PipelineConfig,
        options: RunOptions,
    ) -> Result<()> {
        if !self.mark_running(job).await? {
            return Ok(());
        }

        // --- Load ---
        self.log(job, JobLogEntry::info(format!("Loading configuration '{}'", config.name)))
            .await;
        let loaded = load_pipeline(&config, &self.factory)?;
        for warning in &loaded.warnings {
            self.log(job, JobLogEntry::warn(warning.to_string())).await;
        }
        let Some((pipeline, engine)) = self.attach(job, loaded).await? else {
            return Ok(());
        };

        let fetch = !options.only_generate;
        let generate = !options.only_fetch;
        let legacy = pipeline.legacy_generators();
        let exporters = pipeline.exporter_plugins();

        let mut total = 0;
        if fetch {
            total += pipeline.sources.len();
        }
        if generate {
            total += 1 + usize::from(!legacy.is_empty()) + usize::from(!exporters.is_empty());
        }
        let mut done = 0;
        let mut usage = TickUsage::default();

        // --- Fetch ---
        if fetch {
            for source in &pipeline.sources {
                if job.is_finished() {
                    return Ok(());
                }
                let name = source.name.as_str();
                let items = match &options.historical {
                    Some(filter) => engine.fetch_and_store_range(name, filter).await?,
                    None => engine.fetch_and_store(name).await?,
                };
                usage.items_fetched += items.len() as u64;
                self.log(
                    job,
                    JobLogEntry::info(format!("Fetched {} new items from '{name}'", items.len())),
                )
                .await;
                done += 1;
                self.set_progress(job, done, total).await;
            }
        }

        // --- Generate ---
        if generate && !job.is_finished() {
            let (start, end) = match &options.historical {
                Some(filter) => filter.bounds()?,
                None => {
                    let today = Utc::now().date_naive();
                    (today, today)
                }
            };

            let remember = |name: &str, result: &GeneratorResult| {
                lock(&job.state)
                    .last_results
                    .insert(name.to_string(), result.clone());
            };
            let run_options = RunGeneratorsOptions {
                generators: pipeline.modern_generators(),
                storage: pipeline.primary_storage(),
                output_path: options.output_path.clone(),
                force: options.force,
                token_budget: options.token_budget,
                seed_results: HashMap::new(),
                on_complete: Some(&remember),
            };

            engine.set_phase(AggregationPhase::Generating);
            let run = run_generators_for_range(start, end, &run_options).await;
            engine.set_phase(AggregationPhase::Idle);
            let run = run?;

            usage.tokens_used += run.total_tokens_used;
            usage.estimated_cost_usd += run.total_estimated_cost_usd;
            for warning in &run.warnings {
                self.log(job, JobLogEntry::warn(warning.clone())).await;
            }
            for failure in &run.errors {
                self.log(job, JobLogEntry::warn(format!("Generator error: {failure}")))
                    .await;
            }
            if run.budget_exhausted {
                self.log(job, JobLogEntry::warn("Token budget exhausted")).await;
            }
            self.log(
                job,
                JobLogEntry::info(format!(
                    "Generated {} summary items using {} tokens, wrote {} files",
                    run.summary_items.len(),
                    run.total_tokens_used,
                    run.files_written.len()
                )),
            )
            .await;
            done += 1;
            self.set_progress(job, done, total).await;

            if !legacy.is_empty() {
                for date in dates_inclusive(start, end) {
                    for failure in run_legacy_generators_for_date(date, &legacy).await {
                        self.log(job, JobLogEntry::warn(format!("Generator error: {failure}")))
                            .await;
                    }
                }
                done += 1;
                self.set_progress(job, done, total).await;
            }

            // --- Export ---
            if !exporters.is_empty() {
                let export = run_exporters_for_range(start, end, &exporters).await?;
                for failure in &export.errors {
                    self.log(job, JobLogEntry::warn(format!("Exporter error: {failure}")))
                        .await;
                }
                self.log(
                    job,
                    JobLogEntry::info(format!("Exported {} files", export.files_written.len())),
                )
                .await;
                done += 1;
                self.set_progress(job, done, total).await;
            }
        }

        if total == 0 {
            self.set_progress(job, 1, 1).await;
        }
        self.add_usage(job, usage).await;
        self.finish(job, Outcome::Completed).await;
        Ok(())
    }
}
