//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use newsloom_core::{
    JobManager, JobMode, JobRequest, JobSettings, JobStatusPayload, PluginFactory, load_pipeline,
};
use newsloom_shared::{
    AppConfig, DateFilter, JobId, JobRecord, JobStatus, JobStore, expand_home, init_config,
    load_config, load_pipeline_config_from,
};
use newsloom_storage::{MemoryStorage, Storage};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Newsloom: aggregate content, generate summaries, keep it running.
#[derive(Parser)]
#[command(
    name = "newsloom",
    version,
    about = "Fetch, enrich and summarize content from configurable pipelines.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a pipeline configuration as a job.
    Run(RunArgs),

    /// Load a pipeline configuration and report problems without running it.
    Validate {
        /// Path to the pipeline TOML file.
        config: PathBuf,
    },

    /// Inspect recorded jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
pub(crate) struct RunArgs {
    /// Path to the pipeline TOML file.
    config: PathBuf,

    /// Replay a single past day.
    #[arg(long, conflicts_with_all = ["after", "before", "during"])]
    date: Option<NaiveDate>,

    /// Replay days from this date (inclusive).
    #[arg(long, conflicts_with = "during")]
    after: Option<NaiveDate>,

    /// Replay days up to this date (inclusive).
    #[arg(long, conflicts_with = "during")]
    before: Option<NaiveDate>,

    /// Replay exactly this day; wins over other date flags.
    #[arg(long)]
    during: Option<NaiveDate>,

    #[arg(long, conflicts_with = "only_generate")]
    only_fetch: bool,

    #[arg(long)]
    only_generate: bool,

    /// Directory for generator file outputs.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Ask generators to regenerate existing output.
    #[arg(long)]
    force: bool,

    /// Keep ticking until interrupted.
    #[arg(long, conflicts_with = "once")]
    continuous: bool,

    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,

    /// Keep job records in memory instead of the database.
    #[arg(long)]
    ephemeral: bool,
}

impl RunArgs {
    fn date_filter(&self) -> Option<DateFilter> {
        if let Some(date) = self.date.or(self.during) {
            return Some(DateFilter::on(date));
        }
        if self.after.is_none() && self.before.is_none() {
            return None;
        }
        Some(DateFilter {
            after: self.after,
            before: self.before,
            during: None,
        })
    }
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, newest first.
    List,
    /// Show one job with its log trail.
    Show {
        /// Job id.
        id: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "newsloom=info",
        1 => "newsloom=debug",
        _ => "newsloom=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::Validate { config } => cmd_validate(&config),
        Command::Jobs { action } => match action {
            JobsAction::List => cmd_jobs_list().await,
            JobsAction::Show { id } => cmd_jobs_show(&id).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

/// Job store plus manager, with restart recovery applied when enabled.
async fn open_manager(app: &AppConfig, ephemeral: bool) -> Result<Arc<JobManager>> {
    let store: Arc<dyn JobStore> = if ephemeral {
        Arc::new(MemoryStorage::new())
    } else {
        let path = expand_home(&app.defaults.database_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("cannot create {}: {e}", parent.display()))?;
        }
        Arc::new(Storage::open(&path).await?)
    };

    let manager = Arc::new(JobManager::new(
        store,
        PluginFactory::with_builtins(),
        JobSettings::from(app),
    ));

    if app.jobs.recover_on_startup {
        let report = manager.recover_stale_jobs().await?;
        if report.total() > 0 {
            println!(
                "Recovered {} stale job(s) from a previous run ({} cancelled, {} failed)",
                report.total(),
                report.cancelled.len(),
                report.failed.len()
            );
        }
    }
    Ok(manager)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(args: RunArgs) -> Result<()> {
    let app = load_config()?;
    let mut pipeline = load_pipeline_config_from(&args.config)?;
    let historical = args.date_filter();
    if historical.is_some() && args.continuous {
        return Err(eyre!("date flags replay past days and cannot be combined with --continuous"));
    }

    // --- CLI overrides ---
    let settings = &mut pipeline.settings;
    settings.only_fetch |= args.only_fetch;
    settings.only_generate |= args.only_generate;
    settings.force |= args.force;
    if args.once || historical.is_some() {
        settings.run_once = true;
    }
    if args.continuous {
        settings.run_once = false;
    }
    if let Some(output) = &args.output {
        settings.output_path = Some(output.to_string_lossy().into_owned());
    }
    if settings.output_path.is_none() {
        settings.output_path = Some(app.defaults.output_dir.clone());
    }

    let config_name = pipeline.name.clone();
    let mut request = JobRequest::from_config(pipeline);
    if let JobMode::OneTime(options) = &mut request.mode {
        options.historical = historical;
    }
    let continuous = matches!(request.mode, JobMode::Continuous(_));

    let manager = open_manager(&app, args.ephemeral).await?;
    let id = manager.create_job(request).await?;
    info!(job_id = %id, config = %config_name, continuous, "job started");
    if continuous {
        println!("Job {id} running continuously; press Ctrl-C to stop.");
    }

    watch_job(&manager, &id).await?;

    let record = manager
        .get_job(&id)
        .await?
        .ok_or_else(|| eyre!("job {id} disappeared"))?;
    print_summary(&record);
    match record.status {
        JobStatus::Failed => Err(eyre!(
            "job failed: {}",
            record.error.as_deref().unwrap_or("unknown error")
        )),
        _ => Ok(()),
    }
}

/// Render job updates on a spinner until the job ends. Ctrl-C stops it.
async fn watch_job(manager: &Arc<JobManager>, id: &JobId) -> Result<()> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .map_err(|e| eyre!("invalid progress template: {e}"))?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message("starting");

    let mut updates = manager.subscribe_job(id);
    let already_done = manager
        .get_job(id)
        .await?
        .is_some_and(|record| record.status.is_terminal());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;

    while !already_done {
        tokio::select! {
            update = updates.recv() => match update {
                Some(payload) => {
                    spinner.set_message(describe(&payload));
                    if payload.status.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                spinner.set_message("stopping");
                manager.stop_job(id).await?;
            }
        }
    }

    spinner.finish_and_clear();
    Ok(())
}

fn describe(payload: &JobStatusPayload) -> String {
    let agg = &payload.aggregation_status;
    let activity = match &agg.current_source {
        Some(source) => format!("{:?} {source}", agg.current_phase).to_lowercase(),
        None => format!("{:?}", agg.current_phase).to_lowercase(),
    };
    format!(
        "{} [{}] {}% {} | {} items, {} tokens, {} ticks",
        payload.config_name,
        payload.status,
        payload.progress,
        activity,
        payload.usage.items_fetched,
        payload.usage.tokens_used,
        payload.usage.ticks
    )
}

fn print_summary(record: &JobRecord) {
    println!();
    println!("  Job:      {}", record.id);
    println!("  Config:   {}", record.config_name);
    println!("  Type:     {}", record.job_type.as_str());
    println!("  Status:   {}", record.status);
    println!("  Items:    {}", record.usage.items_fetched);
    println!("  Tokens:   {}", record.usage.tokens_used);
    println!("  Cost:     ${:.4}", record.usage.estimated_cost_usd);
    if record.usage.ticks > 0 {
        println!("  Ticks:    {}", record.usage.ticks);
    }
    if let Some(error) = &record.error {
        println!("  Error:    {error}");
    }
    if let Some(reason) = &record.cancel_reason {
        println!("  Reason:   {reason}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn cmd_validate(path: &Path) -> Result<()> {
    let config = load_pipeline_config_from(path)?;
    let loaded = load_pipeline(&config, &PluginFactory::with_builtins())?;

    println!("Configuration '{}' is valid.", loaded.name);
    println!("  Storage:    {}", loaded.storages.len());
    println!("  Sources:    {}", loaded.sources.len());
    println!("  Enrichers:  {}", loaded.enrichers.len());
    println!("  Generators: {}", loaded.generators.len());
    println!("  Exporters:  {}", loaded.exporters.len());
    if loaded.warnings.is_empty() {
        println!("  No warnings.");
    } else {
        println!("  Warnings:");
        for warning in &loaded.warnings {
            println!("    - {warning}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

async fn cmd_jobs_list() -> Result<()> {
    let app = load_config()?;
    let manager = open_manager(&app, false).await?;
    let jobs = manager.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs recorded.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<10}  {:<9}  {:>4}  STARTED",
        "ID", "CONFIG", "TYPE", "STATUS", "PCT"
    );
    for job in jobs {
        println!(
            "{:<36}  {:<20}  {:<10}  {:<9}  {:>3}%  {}",
            job.id,
            job.config_name,
            job.job_type.as_str(),
            job.status.as_str(),
            job.progress,
            job.start_time.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_jobs_show(id: &str) -> Result<()> {
    let id: JobId = id.parse().map_err(|e| eyre!("invalid job id '{id}': {e}"))?;
    let app = load_config()?;
    let manager = open_manager(&app, false).await?;
    let record = manager
        .get_job(&id)
        .await?
        .ok_or_else(|| eyre!("no job with id {id}"))?;

    print_summary(&record);
    if let Some(end) = record.end_time {
        println!("  Started:  {}", record.start_time.format("%Y-%m-%d %H:%M:%S"));
        println!("  Ended:    {}", end.format("%Y-%m-%d %H:%M:%S"));
        println!();
    }
    for entry in &record.logs {
        println!(
            "  {} {:<5} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.level.as_str(),
            entry.message
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
