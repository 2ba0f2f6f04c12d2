//! Generator runner: dependency-ordered generation under a token budget.
//!
//! Generators declare at most one predecessor through
//! [`Generator::depends_on`]. [`sort_by_depends_on`] orders them so a
//! predecessor always runs first; [`run_generators_for_date`] then invokes
//! each one, hands it the predecessor's summaries when that predecessor
//! succeeded with output, persists what it produced, and stops admitting
//! generators once the budget is spent.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{error, info, instrument, warn};

use newsloom_shared::{
    ContentStore, ExportResult, Exporter, FileOutput, Generator, GeneratorContext,
    GeneratorResult, LegacyGenerator, NewsloomError, Result, SummaryItem, dates_inclusive,
};

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Generators in run order, plus non-fatal ordering warnings.
#[derive(Clone, Default)]
pub struct SortedGenerators {
    pub generators: Vec<Arc<dyn Generator>>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Depth-first topological sort over each generator's `depends_on`.
///
/// Generators without a dependency keep their input order. A dependency
/// naming no known generator produces a warning and no ordering
/// constraint. A cycle is an error naming one generator in it.
pub fn sort_by_depends_on(generators: &[Arc<dyn Generator>]) -> Result<SortedGenerators> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, g) in generators.iter().enumerate() {
        index.entry(g.name()).or_insert(i);
    }

    let mut marks = vec![Mark::Unvisited; generators.len()];
    let mut sorted = SortedGenerators::default();

    fn visit(
        i: usize,
        generators: &[Arc<dyn Generator>],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
        sorted: &mut SortedGenerators,
    ) -> Result<()> {
        match marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                return Err(NewsloomError::DependencyCycle(
                    generators[i].name().to_string(),
                ));
            }
            Mark::Unvisited => {}
        }
        marks[i] = Mark::Visiting;

        if let Some(dep) = generators[i].depends_on() {
            match index.get(dep) {
                Some(&j) => visit(j, generators, index, marks, sorted)?,
                None => {
                    let msg = format!(
                        "generator '{}' depends on unknown generator '{dep}'; running it unordered",
                        generators[i].name()
                    );
                    warn!("{msg}");
                    sorted.warnings.push(msg);
                }
            }
        }

        marks[i] = Mark::Done;
        sorted.generators.push(generators[i].clone());
        Ok(())
    }

    for i in 0..generators.len() {
        visit(i, generators, &index, &mut marks, &mut sorted)?;
    }
    Ok(sorted)
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

/// Per-generator completion hook.
pub type OnComplete<'a> = &'a (dyn Fn(&str, &GeneratorResult) + Send + Sync);

/// Inputs to a generator run.
#[derive(Default)]
pub struct RunGeneratorsOptions<'a> {
    pub generators: Vec<Arc<dyn Generator>>,
    /// Where summary items are persisted. Without one they are only returned.
    pub storage: Option<Arc<dyn ContentStore>>,
    /// Root for file outputs. Without one file outputs are skipped.
    pub output_path: Option<PathBuf>,
    pub force: bool,
    pub token_budget: Option<i64>,
    /// Results from earlier runs, consulted when a predecessor is not part
    /// of this run.
    pub seed_results: HashMap<String, GeneratorResult>,
    pub on_complete: Option<OnComplete<'a>>,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct RunGeneratorsResult {
    pub summary_items: Vec<SummaryItem>,
    pub total_tokens_used: u64,
    pub total_estimated_cost_usd: f64,
    /// Keyed by generator name. Generators cut off by the budget are absent.
    pub generator_results: BTreeMap<String, GeneratorResult>,
    pub any_skipped: bool,
    pub any_failed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub files_written: Vec<PathBuf>,
    /// Budget left after the run, never below zero.
    pub remaining_budget: Option<i64>,
    pub budget_exhausted: bool,
}

impl RunGeneratorsResult {
    fn merge(&mut self, day: RunGeneratorsResult) {
        self.summary_items.extend(day.summary_items);
        self.total_tokens_used += day.total_tokens_used;
        self.total_estimated_cost_usd += day.total_estimated_cost_usd;
        self.generator_results.extend(day.generator_results);
        self.any_skipped |= day.any_skipped;
        self.any_failed |= day.any_failed;
        self.errors.extend(day.errors);
        for w in day.warnings {
            if !self.warnings.contains(&w) {
                self.warnings.push(w);
            }
        }
        self.files_written.extend(day.files_written);
        self.remaining_budget = day.remaining_budget;
        self.budget_exhausted |= day.budget_exhausted;
    }
}

/// Run every generator for one day, in dependency order.
#[instrument(skip_all, fields(%date, generators = options.generators.len()))]
pub async fn run_generators_for_date(
    date: NaiveDate,
    options: &RunGeneratorsOptions<'_>,
) -> Result<RunGeneratorsResult> {
    run_day(date, options, options.token_budget).await
}

async fn run_day(
    date: NaiveDate,
    options: &RunGeneratorsOptions<'_>,
    budget: Option<i64>,
) -> Result<RunGeneratorsResult> {
    let sorted = sort_by_depends_on(&options.generators)?;
    let mut run = RunGeneratorsResult {
        warnings: sorted.warnings,
        remaining_budget: budget,
        ..RunGeneratorsResult::default()
    };
    let mut recorded: HashMap<String, GeneratorResult> = options.seed_results.clone();

    for generator in &sorted.generators {
        let name = generator.name().to_string();

        if run.remaining_budget.is_some_and(|left| left <= 0) {
            run.budget_exhausted = true;
            info!(generator = %name, "token budget exhausted, not admitting further generators");
            break;
        }

        // --- Context ---
        let upstream_summaries = generator
            .depends_on()
            .and_then(|dep| recorded.get(dep))
            .filter(|r| r.success && !r.summary_items.is_empty())
            .map(|r| r.summary_items.clone());
        let ctx = GeneratorContext {
            force: options.force,
            upstream_summaries,
            token_budget: run.remaining_budget,
        };

        // --- Invoke ---
        let result = match generator.generate(date, ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(generator = %name, error = %e, "generator failed");
                GeneratorResult::failed(e.to_string())
            }
        };

        // --- Persist ---
        if result.success && !result.skipped {
            persist_summaries(&name, &result.summary_items, options.storage.as_deref()).await;
            let written =
                write_file_outputs(&name, &result.file_outputs, options.output_path.as_deref())
                    .await;
            run.files_written.extend(written);
            run.summary_items.extend(result.summary_items.iter().cloned());
        }
        if result.skipped {
            run.any_skipped = true;
        }
        if !result.success {
            run.any_failed = true;
            run.errors.push(format!(
                "{name}: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }

        // --- Budget ---
        let tokens = result.tokens_used();
        run.total_tokens_used += tokens;
        run.total_estimated_cost_usd += result.estimated_cost_usd();
        if let Some(left) = run.remaining_budget.as_mut() {
            *left = (*left - tokens as i64).max(0);
        }
        info!(
            generator = %name,
            success = result.success,
            skipped = result.skipped,
            tokens,
            remaining_budget = ?run.remaining_budget,
            "generator finished"
        );

        if let Some(hook) = options.on_complete {
            hook(&name, &result);
        }
        recorded.insert(name.clone(), result.clone());
        run.generator_results.insert(name, result);

        if run.remaining_budget.is_some_and(|left| left <= 0) {
            run.budget_exhausted = true;
            info!("token budget exhausted");
            break;
        }
    }

    Ok(run)
}

/// Run every generator for each day from `start` to `end` inclusive.
///
/// Summary items and usage accumulate across days; per-generator results
/// keep the last day's entry. The budget is shared by the whole range.
#[instrument(skip_all, fields(%start, %end))]
pub async fn run_generators_for_range(
    start: NaiveDate,
    end: NaiveDate,
    options: &RunGeneratorsOptions<'_>,
) -> Result<RunGeneratorsResult> {
    if start > end {
        return Err(NewsloomError::validation(format!(
            "range start {start} is after end {end}"
        )));
    }

    let mut total = RunGeneratorsResult {
        remaining_budget: options.token_budget,
        ..RunGeneratorsResult::default()
    };
    for date in dates_inclusive(start, end) {
        let day = run_day(date, options, total.remaining_budget).await?;
        total.merge(day);
        if total.budget_exhausted {
            info!(%date, "token budget exhausted, skipping remaining days");
            break;
        }
    }
    Ok(total)
}

async fn persist_summaries(
    generator: &str,
    items: &[SummaryItem],
    storage: Option<&dyn ContentStore>,
) {
    if items.is_empty() {
        return;
    }
    let Some(storage) = storage else {
        warn!(generator, count = items.len(), "no storage configured, summaries not persisted");
        return;
    };
    for item in items {
        if let Err(e) = storage.save_summary_item(item).await {
            error!(generator, kind = %item.kind, error = %e, "failed to save summary item");
        }
    }
}

/// Resolve `relative` under `root`, refusing anything that could leave it.
fn resolve_output_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let escapes = rel.as_os_str().is_empty()
        || rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(NewsloomError::validation(format!(
            "output path '{relative}' must be relative and stay inside the output directory"
        )));
    }
    Ok(root.join(rel))
}

async fn write_file_outputs(
    generator: &str,
    files: &[FileOutput],
    root: Option<&Path>,
) -> Vec<PathBuf> {
    if files.is_empty() {
        return Vec::new();
    }
    let Some(root) = root else {
        warn!(generator, count = files.len(), "no output path configured, file outputs skipped");
        return Vec::new();
    };

    let mut written = Vec::new();
    for file in files {
        let path = match resolve_output_path(root, &file.relative_path) {
            Ok(path) => path,
            Err(e) => {
                error!(generator, error = %e, "rejected file output");
                continue;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(generator, path = %parent.display(), error = %e, "failed to create output directory");
                continue;
            }
        }
        match tokio::fs::write(&path, &file.content).await {
            Ok(()) => written.push(path),
            Err(e) => error!(generator, path = %path.display(), error = %e, "failed to write file output"),
        }
    }
    written
}

// ---------------------------------------------------------------------------
// Legacy generators
// ---------------------------------------------------------------------------

/// Run self-persisting generators for one day. Returns one error message
/// per failed generator.
pub async fn run_legacy_generators_for_date(
    date: NaiveDate,
    generators: &[Arc<dyn LegacyGenerator>],
) -> Vec<String> {
    let mut errors = Vec::new();
    for generator in generators {
        if let Err(e) = generator.generate_and_store_summary(date).await {
            error!(generator = generator.name(), %date, error = %e, "legacy generator failed");
            errors.push(format!("{}: {e}", generator.name()));
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Exporters
// ---------------------------------------------------------------------------

/// Aggregate outcome of an export run.
#[derive(Debug, Clone, Default)]
pub struct ExportRunResult {
    /// Keyed by exporter name; the last day wins in a range.
    pub results: BTreeMap<String, ExportResult>,
    pub files_written: Vec<String>,
    pub errors: Vec<String>,
}

/// Run every exporter for one day, in order.
pub async fn run_exporters_for_date(
    date: NaiveDate,
    exporters: &[Arc<dyn Exporter>],
) -> ExportRunResult {
    let mut run = ExportRunResult::default();
    for exporter in exporters {
        let name = exporter.name().to_string();
        let result = match exporter.export(date).await {
            Ok(result) => result,
            Err(e) => {
                error!(exporter = %name, %date, error = %e, "exporter failed");
                ExportResult::failed(e.to_string())
            }
        };
        if !result.success {
            run.errors.push(format!(
                "{name}: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
        run.files_written.extend(result.files_written.iter().cloned());
        run.results.insert(name, result);
    }
    run
}

/// Run every exporter for each day from `start` to `end` inclusive.
pub async fn run_exporters_for_range(
    start: NaiveDate,
    end: NaiveDate,
    exporters: &[Arc<dyn Exporter>],
) -> Result<ExportRunResult> {
    if start > end {
        return Err(NewsloomError::validation(format!(
            "range start {start} is after end {end}"
        )));
    }
    let mut total = ExportRunResult::default();
    for date in dates_inclusive(start, end) {
        let day = run_exporters_for_date(date, exporters).await;
        total.results.extend(day.results);
        total.files_written.extend(day.files_written);
        total.errors.extend(day.errors);
    }
    Ok(total)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Scripted generators shared with job tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    pub struct ScriptedGenerator {
        pub name: String,
        pub depends_on: Option<String>,
        pub tokens: u64,
        pub fail: bool,
        pub summaries: usize,
        pub files: Vec<FileOutput>,
        pub calls: AtomicUsize,
        /// Upstream summary count seen on each call (`None` = no upstream).
        pub seen_upstream: Mutex<Vec<Option<usize>>>,
        pub seen_budget: Mutex<Vec<Option<i64>>>,
    }

    impl ScriptedGenerator {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                depends_on: None,
                tokens: 0,
                fail: false,
                summaries: 1,
                files: Vec::new(),
                calls: AtomicUsize::new(0),
                seen_upstream: Mutex::new(Vec::new()),
                seen_budget: Mutex::new(Vec::new()),
            }
        }

        pub fn after(mut self, dep: &str) -> Self {
            self.depends_on = Some(dep.into());
            self
        }

        pub fn tokens(mut self, tokens: u64) -> Self {
            self.tokens = tokens;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        pub fn summaries(mut self, n: usize) -> Self {
            self.summaries = n;
            self
        }

        pub fn files(mut self, files: Vec<FileOutput>) -> Self {
            self.files = files;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn arc(self) -> Arc<Self> {
            Arc::new(self)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        fn name(&self) -> &str {
            &self.name
        }

        fn depends_on(&self) -> Option<&str> {
            self.depends_on.as_deref()
        }

        async fn generate(&self, date: NaiveDate, ctx: GeneratorContext) -> Result<GeneratorResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_upstream
                .lock()
                .unwrap()
                .push(ctx.upstream_summaries.as_ref().map(Vec::len));
            self.seen_budget.lock().unwrap().push(ctx.token_budget);
            if self.fail {
                return Err(NewsloomError::Generator(format!("{} exploded", self.name)));
            }
            let items = (0..self.summaries)
                .map(|n| SummaryItem {
                    kind: "testSummary".into(),
                    title: Some(format!("{} #{n}", self.name)),
                    generator: self.name.clone(),
                    date,
                    content: serde_json::json!({ "n": n }),
                    markdown: None,
                })
                .collect();
            Ok(GeneratorResult::succeeded(items)
                .with_files(self.files.clone())
                .with_stats(self.tokens, self.tokens as f64 * 0.001))
        }
    }

    pub fn as_dyn(gens: &[Arc<ScriptedGenerator>]) -> Vec<Arc<dyn Generator>> {
        gens.iter()
            .map(|g| g.clone() as Arc<dyn Generator>)
            .collect()
    }
}
