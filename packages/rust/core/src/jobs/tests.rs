use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::broadcast::error::TryRecvError;

use newsloom_shared::{
    AggregationState, ContentItem, ContentStore, Entitlement, Generator, GeneratorContext,
    GeneratorResult, JobStatus, JobType, NewsloomError, PipelineConfig, Source, SummaryItem,
    parse_pipeline_config,
};
use newsloom_storage::MemoryStorage;

use super::*;
use crate::aggregator::test_support::{MockSource, item};
use crate::generators::test_support::ScriptedGenerator;
use crate::plugins::{Plugin, PluginArgs};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    manager: Arc<JobManager>,
    jobs: Arc<MemoryStorage>,
    content: Arc<MemoryStorage>,
}

/// A factory whose `mock` type hands out pre-built plugins by name, with
/// one in-memory content store registered as `mem`.
fn harness(plugins: Vec<(&str, Plugin)>) -> Harness {
    let content = Arc::new(MemoryStorage::new());
    let mut table: HashMap<String, Plugin> = plugins
        .into_iter()
        .map(|(name, plugin)| (name.to_string(), plugin))
        .collect();
    table.insert("mem".into(), Plugin::Storage(content.clone()));

    let mut factory = PluginFactory::with_builtins();
    factory.register("mock", move |args: PluginArgs| {
        table
            .get(&args.name)
            .cloned()
            .ok_or_else(|| NewsloomError::config(format!("no mock named '{}'", args.name)))
    });

    let jobs = Arc::new(MemoryStorage::new());
    let settings = JobSettings {
        engine_grace: Duration::from_secs(30),
        default_interval: Duration::from_secs(3600),
        event_capacity: 1024,
    };
    let manager = Arc::new(JobManager::new(jobs.clone(), factory, settings));
    Harness {
        manager,
        jobs,
        content,
    }
}

fn pipeline(settings: &str, sources: &[&str], generators: &[&str]) -> PipelineConfig {
    let mut text = format!(
        "name = \"daily\"\n[settings]\n{settings}\n[[storage]]\ntype = \"mock\"\nname = \"mem\"\n"
    );
    for name in sources {
        text.push_str(&format!("[[sources]]\ntype = \"mock\"\nname = \"{name}\"\n"));
    }
    for name in generators {
        text.push_str(&format!("[[generators]]\ntype = \"mock\"\nname = \"{name}\"\n"));
    }
    parse_pipeline_config(&text).unwrap()
}

fn source(s: &Arc<MockSource>) -> Plugin {
    Plugin::Source(s.clone() as Arc<dyn Source>)
}

fn generator(g: &Arc<ScriptedGenerator>) -> Plugin {
    Plugin::Generator(g.clone() as Arc<dyn Generator>)
}

/// Entitlement that can be switched off mid-run.
struct Switch(AtomicBool);

#[async_trait]
impl Entitlement for Switch {
    async fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Source whose fetch takes `delay`, counts starts and finishes, and
/// returns one fresh item per call.
struct SlowSource {
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl SlowSource {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Source for SlowSource {
    fn name(&self) -> &str {
        "slow"
    }

    async fn fetch_items(&self) -> newsloom_shared::Result<Vec<ContentItem>> {
        let call = self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(vec![item("slow", &format!("post {call}"))])
    }
}

/// Content store that rejects every call after `close`, like the libSQL one.
#[derive(Default)]
struct ClosableStore {
    inner: MemoryStorage,
    closed: AtomicBool,
}

impl ClosableStore {
    fn check(&self) -> newsloom_shared::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NewsloomError::Storage("store is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for ClosableStore {
    async fn init(&self) -> newsloom_shared::Result<()> {
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> newsloom_shared::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_content_item(
        &self,
        content_id: &str,
    ) -> newsloom_shared::Result<Option<ContentItem>> {
        self.check()?;
        self.inner.get_content_item(content_id).await
    }

    async fn save_content_items(&self, items: &[ContentItem]) -> newsloom_shared::Result<usize> {
        self.check()?;
        self.inner.save_content_items(items).await
    }

    async fn save_summary_item(&self, item: &SummaryItem) -> newsloom_shared::Result<()> {
        self.check()?;
        self.inner.save_summary_item(item).await
    }
}

/// `slow` as the only source, persisting into a [`ClosableStore`].
fn closable_pipeline(settings: &str) -> PipelineConfig {
    parse_pipeline_config(&format!(
        r#"
name = "daily"
[settings]
{settings}
[[storage]]
type = "mock"
name = "shelf"
[[sources]]
type = "mock"
name = "slow"
"#
    ))
    .unwrap()
}

struct PanickingGenerator;

#[async_trait]
impl Generator for PanickingGenerator {
    fn name(&self) -> &str {
        "boom"
    }

    async fn generate(
        &self,
        _date: NaiveDate,
        _ctx: GeneratorContext,
    ) -> newsloom_shared::Result<GeneratorResult> {
        panic!("generator blew up");
    }
}

// ---------------------------------------------------------------------------
// One-time jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_time_job_fetches_generates_and_completes() {
    let feed = MockSource::new("feed", vec![item("feed", "one"), item("feed", "two")]);
    let digest = ScriptedGenerator::new("digest").tokens(10).arc();
    let h = harness(vec![("feed", source(&feed)), ("digest", generator(&digest))]);

    let request = JobRequest::from_config(pipeline("run_once = true", &["feed"], &["digest"]));
    let id = h.manager.create_job(request).await.unwrap();
    let record = h.manager.wait_for_job(&id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.job_type, JobType::OneTime);
    assert_eq!(record.progress, 100);
    assert_eq!(record.usage.items_fetched, 2);
    assert_eq!(record.usage.tokens_used, 10);
    assert_eq!(feed.calls(), 1);
    assert_eq!(digest.calls(), 1);

    assert_eq!(h.content.content_items().await.len(), 2);
    assert_eq!(h.content.summaries_for(Utc::now().date_naive()).await.len(), 1);

    let messages: Vec<&str> = record.logs.iter().map(|l| l.message.as_str()).collect();
    assert!(messages.contains(&"Fetched 2 new items from 'feed'"));
    assert_eq!(messages.last(), Some(&"Job completed"));
}

#[tokio::test]
async fn finished_one_time_engine_stays_visible_during_grace() {
    let feed = MockSource::new("feed", vec![item("feed", "one"), item("feed", "two")]);
    let h = harness(vec![("feed", source(&feed))]);

    let id = h
        .manager
        .create_job(JobRequest::from_config(pipeline("run_once = true", &["feed"], &[])))
        .await
        .unwrap();
    h.manager.wait_for_job(&id).await.unwrap();

    let status = h.manager.get_job_status(&id).await.unwrap().unwrap();
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.aggregation_status.stats.total_items_fetched, 2);

    let engine = h.manager.engines().get("daily").await.unwrap();
    assert_eq!(engine.status().state, AggregationState::Stopped);
}

#[tokio::test]
async fn only_fetch_skips_generation() {
    let feed = MockSource::new("feed", vec![item("feed", "one")]);
    let digest = ScriptedGenerator::new("digest").arc();
    let h = harness(vec![("feed", source(&feed)), ("digest", generator(&digest))]);

    let config = pipeline("run_once = true\nonly_fetch = true", &["feed"], &["digest"]);
    let id = h.manager.create_job(JobRequest::from_config(config)).await.unwrap();
    let record = h.manager.wait_for_job(&id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(feed.calls(), 1);
    assert_eq!(digest.calls(), 0);
}

#[tokio::test]
async fn historical_run_replays_each_day() {
    let archive = MockSource::new("archive", vec![item("archive", "post")]);
    let digest = ScriptedGenerator::new("digest").tokens(5).arc();
    let h = harness(vec![
        (
            "archive",
            Plugin::HistoricalSource(archive.clone() as Arc<dyn newsloom_shared::HistoricalSource>),
        ),
        ("digest", generator(&digest)),
    ]);

    let start: NaiveDate = "2025-03-01".parse().unwrap();
    let end: NaiveDate = "2025-03-03".parse().unwrap();
    let request = JobRequest::new(
        pipeline("run_once = true", &["archive"], &["digest"]),
        JobMode::OneTime(RunOptions {
            historical: Some(DateFilter::between(start, end)),
            ..RunOptions::default()
        }),
    );
    let id = h.manager.create_job(request).await.unwrap();
    let record = h.manager.wait_for_job(&id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(archive.historical_calls.lock().unwrap().len(), 3);
    assert_eq!(archive.calls(), 0);
    assert_eq!(digest.calls(), 3);
    assert_eq!(record.usage.items_fetched, 3);
    assert_eq!(record.usage.tokens_used, 15);
}

#[tokio::test]
async fn unknown_plugin_type_fails_the_job() {
    let h = harness(Vec::new());
    let config = parse_pipeline_config(
        r#"
name = "daily"
[settings]
run_once = true
[[sources]]
type = "nope"
name = "mystery"
"#,
    )
    .unwrap();

    let id = h.manager.create_job(JobRequest::from_config(config)).await.unwrap();
    let record = h.manager.wait_for_job(&id).await.unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.unwrap().contains("unknown plugin type 'nope'"));
    assert!(record.logs.iter().any(|l| l.message.starts_with("Job failed")));
}

#[tokio::test]
async fn panic_in_a_plugin_fails_the_job() {
    let h = harness(vec![(
        "boom",
        Plugin::Generator(Arc::new(PanickingGenerator) as Arc<dyn Generator>),
    )]);

    let id = h
        .manager
        .create_job(JobRequest::from_config(pipeline("run_once = true", &[], &["boom"])))
        .await
        .unwrap();
    let record = h.manager.wait_for_job(&id).await.unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    let error = record.error.unwrap();
    assert!(error.contains("panicked"), "{error}");
    assert!(error.contains("generator blew up"), "{error}");
}

#[tokio::test]
async fn stopping_a_finished_job_is_a_no_op() {
    let feed = MockSource::new("feed", vec![item("feed", "one")]);
    let h = harness(vec![("feed", source(&feed))]);

    let id = h
        .manager
        .create_job(JobRequest::from_config(pipeline("run_once = true", &["feed"], &[])))
        .await
        .unwrap();
    h.manager.wait_for_job(&id).await.unwrap();
    let logs_before = h.jobs.get_job(&id).await.unwrap().unwrap().logs.len();

    assert!(!h.manager.stop_job(&id).await.unwrap());
    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.logs.len(), logs_before);

    let missing = h.manager.stop_job(&JobId::new()).await;
    assert!(matches!(missing, Err(NewsloomError::NotFound(_))));
}

#[tokio::test]
async fn engine_status_is_forwarded_per_config() {
    let feed = MockSource::new("feed", vec![item("feed", "one")]);
    let h = harness(vec![("feed", source(&feed))]);
    let mut updates = h.manager.subscribe_config("daily");

    let id = h
        .manager
        .create_job(JobRequest::from_config(pipeline("run_once = true", &["feed"], &[])))
        .await
        .unwrap();
    h.manager.wait_for_job(&id).await.unwrap();

    let mut last = None;
    while let Ok(Some(status)) =
        tokio::time::timeout(Duration::from_millis(200), updates.recv()).await
    {
        last = Some(status);
    }
    let last = last.expect("at least one status update");
    assert_eq!(last.state, AggregationState::Stopped);
    assert_eq!(last.stats.total_items_fetched, 1);
}

// ---------------------------------------------------------------------------
// Continuous jobs
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn continuous_job_ticks_until_stopped() {
    let feed = MockSource::new("feed", vec![item("feed", "one")]);
    let digest = ScriptedGenerator::new("digest").tokens(3).arc();
    let h = harness(vec![("feed", source(&feed)), ("digest", generator(&digest))]);

    let config = pipeline("global_interval_secs = 60", &["feed"], &["digest"]);
    let id = h
        .manager
        .create_job(JobRequest::from_config(config))
        .await
        .unwrap();

    // Initial pass.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(feed.calls(), 1);
    assert_eq!(digest.calls(), 1);
    let running = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.job_type, JobType::Continuous);

    // Ticks at 60s and 120s.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.calls(), 2);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(feed.calls(), 3);
    assert_eq!(digest.calls(), 3);

    assert!(h.manager.stop_job(&id).await.unwrap());
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(feed.calls(), 3);
    assert_eq!(digest.calls(), 3);

    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.usage.ticks, 5);
    assert_eq!(record.usage.items_fetched, 1);
    assert_eq!(record.usage.tokens_used, 9);
    assert!(record.logs.iter().any(|l| l.message == "Job stopped by user"));
    assert!(h.manager.engines().get("daily").await.is_none());
    assert!(!h.manager.stop_job(&id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn plugin_intervals_apply_without_a_global_one() {
    let fast = MockSource::new("fast", vec![item("fast", "x")]);
    let slow = MockSource::new("slow", vec![item("slow", "y")]);
    let h = harness(vec![("fast", source(&fast)), ("slow", source(&slow))]);

    let config = parse_pipeline_config(
        r#"
name = "daily"
[[storage]]
type = "mock"
name = "mem"
[[sources]]
type = "mock"
name = "fast"
interval_secs = 10
[[sources]]
type = "mock"
name = "slow"
"#,
    )
    .unwrap();
    let id = h
        .manager
        .create_job(JobRequest::from_config(config))
        .await
        .unwrap();

    // `slow` falls back to the hourly default.
    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(fast.calls(), 4);
    assert_eq!(slow.calls(), 1);

    h.manager.stop_job(&id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lapsed_entitlement_cancels_exactly_once() {
    let a = MockSource::new("a", vec![item("a", "one")]);
    let b = MockSource::new("b", vec![item("b", "two")]);
    let h = harness(vec![("a", source(&a)), ("b", source(&b))]);
    let switch = Arc::new(Switch(AtomicBool::new(true)));

    let request = JobRequest::from_config(pipeline("global_interval_secs = 60", &["a", "b"], &[]))
        .with_entitlement(switch.clone());
    let id = h.manager.create_job(request).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!((a.calls(), b.calls()), (1, 1));

    let mut events = h.manager.events().subscribe();
    switch.0.store(false, Ordering::SeqCst);

    // Both sources tick at 60s; only one may perform the transition.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!((a.calls(), b.calls()), (1, 1));

    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.cancel_reason.as_deref(), Some(ENTITLEMENT_LAPSED));
    let cancel_logs = record
        .logs
        .iter()
        .filter(|l| l.message.contains(ENTITLEMENT_LAPSED))
        .count();
    assert_eq!(cancel_logs, 1);

    let mut cancelled_events = 0;
    loop {
        match events.try_recv() {
            Ok(StatusEvent::JobStatusUpdate(p)) if p.status == JobStatus::Cancelled => {
                assert_eq!(p.cancel_reason.as_deref(), Some(ENTITLEMENT_LAPSED));
                cancelled_events += 1;
            }
            Ok(_) => continue,
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    assert_eq!(cancelled_events, 1);
}

#[tokio::test(start_paused = true)]
async fn in_flight_tick_finishes_after_stop() {
    let slow = SlowSource::new(Duration::from_secs(10));
    let h = harness(vec![("slow", Plugin::Source(slow.clone() as Arc<dyn Source>))]);

    let id = h
        .manager
        .create_job(JobRequest::from_config(pipeline(
            "global_interval_secs = 60",
            &["slow"],
            &[],
        )))
        .await
        .unwrap();

    // Initial pass runs 0..10s, so ticks fall at 70s, 130s, ...
    tokio::time::sleep(Duration::from_secs(75)).await;
    assert_eq!(slow.started.load(Ordering::SeqCst), 2);
    assert_eq!(slow.finished.load(Ordering::SeqCst), 1);

    assert!(h.manager.stop_job(&id).await.unwrap());
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(slow.started.load(Ordering::SeqCst), 2);
    assert_eq!(slow.finished.load(Ordering::SeqCst), 2);
    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn storage_stays_open_for_an_in_flight_tick() {
    let slow = SlowSource::new(Duration::from_secs(10));
    let shelf = Arc::new(ClosableStore::default());
    let h = harness(vec![
        ("slow", Plugin::Source(slow.clone() as Arc<dyn Source>)),
        ("shelf", Plugin::Storage(shelf.clone() as Arc<dyn ContentStore>)),
    ]);

    let id = h
        .manager
        .create_job(JobRequest::from_config(closable_pipeline(
            "global_interval_secs = 60",
        )))
        .await
        .unwrap();

    // Second tick started at 70s and is still fetching.
    tokio::time::sleep(Duration::from_secs(75)).await;
    assert_eq!(slow.started.load(Ordering::SeqCst), 2);
    assert_eq!(shelf.inner.content_items().await.len(), 1);

    assert!(h.manager.stop_job(&id).await.unwrap());
    assert!(!shelf.closed.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(slow.finished.load(Ordering::SeqCst), 2);
    assert_eq!(shelf.inner.content_items().await.len(), 2);
    assert!(shelf.closed.load(Ordering::SeqCst));

    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.usage.items_fetched, 2);
    let failures: Vec<&str> = record
        .logs
        .iter()
        .map(|l| l.message.as_str())
        .filter(|m| m.contains("failed"))
        .collect();
    assert!(failures.is_empty(), "{failures:?}");
}

#[tokio::test(start_paused = true)]
async fn stopped_one_time_job_keeps_its_in_flight_fetch() {
    let slow = SlowSource::new(Duration::from_secs(10));
    let shelf = Arc::new(ClosableStore::default());
    let h = harness(vec![
        ("slow", Plugin::Source(slow.clone() as Arc<dyn Source>)),
        ("shelf", Plugin::Storage(shelf.clone() as Arc<dyn ContentStore>)),
    ]);

    let id = h
        .manager
        .create_job(JobRequest::from_config(closable_pipeline("run_once = true")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.manager.stop_job(&id).await.unwrap());
    assert!(!shelf.closed.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(slow.finished.load(Ordering::SeqCst), 1);
    assert_eq!(shelf.inner.content_items().await.len(), 1);
    assert!(shelf.closed.load(Ordering::SeqCst));

    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    let messages: Vec<&str> = record.logs.iter().map(|l| l.message.as_str()).collect();
    assert!(messages.contains(&"Fetched 1 new items from 'slow'"));
    assert!(!messages.iter().any(|m| m.contains("failed")), "{messages:?}");
}

#[tokio::test(start_paused = true)]
async fn generator_ticks_share_the_job_budget() {
    let digest = ScriptedGenerator::new("digest").tokens(40).arc();
    let h = harness(vec![("digest", generator(&digest))]);

    let config = pipeline("global_interval_secs = 60\ntoken_budget = 100", &[], &["digest"]);
    let id = h
        .manager
        .create_job(JobRequest::from_config(config))
        .await
        .unwrap();

    // 100 → 60 → 20 → 0, then every later tick is skipped.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(digest.calls(), 3);
    assert_eq!(
        *digest.seen_budget.lock().unwrap(),
        vec![Some(100), Some(60), Some(20)]
    );

    h.manager.stop_job(&id).await.unwrap();
    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.usage.tokens_used, 120);
}

#[tokio::test(start_paused = true)]
async fn overlapping_jobs_restore_the_previous_engine() {
    let feed = MockSource::new("feed", vec![item("feed", "one")]);
    let h = harness(vec![("feed", source(&feed))]);

    let first = h
        .manager
        .create_job(JobRequest::from_config(pipeline("", &["feed"], &[])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let first_engine = h.manager.engines().get("daily").await.unwrap();

    let second = h
        .manager
        .create_job(JobRequest::from_config(pipeline("", &["feed"], &[])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let second_engine = h.manager.engines().get("daily").await.unwrap();
    assert!(!Arc::ptr_eq(&first_engine, &second_engine));

    h.manager.stop_job(&second).await.unwrap();
    let visible = h.manager.engines().get("daily").await.unwrap();
    assert!(Arc::ptr_eq(&visible, &first_engine));

    h.manager.stop_job(&first).await.unwrap();
    assert!(h.manager.engines().get("daily").await.is_none());
}

// ---------------------------------------------------------------------------
// Requests and recovery
// ---------------------------------------------------------------------------

#[test]
fn request_mode_follows_settings() {
    let once = JobRequest::from_config(pipeline("run_once = true\ntoken_budget = 50", &[], &[]));
    match once.mode {
        JobMode::OneTime(options) => assert_eq!(options.token_budget, Some(50)),
        JobMode::Continuous(_) => panic!("expected a one-time job"),
    }

    let forever = JobRequest::from_config(pipeline("global_interval_secs = 30", &[], &[]));
    match forever.mode {
        JobMode::Continuous(options) => {
            assert_eq!(options.global_interval, Some(Duration::from_secs(30)))
        }
        JobMode::OneTime(_) => panic!("expected a continuous job"),
    }
}

#[tokio::test]
async fn restart_sweep_settles_stale_jobs() {
    let h = harness(Vec::new());
    let continuous = JobRecord::pending(JobId::new(), "feeds", JobType::Continuous);
    let running = JobRecord::pending(JobId::new(), "digest", JobType::OneTime);
    let pending = JobRecord::pending(JobId::new(), "digest", JobType::OneTime);
    let finished = JobRecord::pending(JobId::new(), "digest", JobType::OneTime);
    for record in [&continuous, &running, &pending, &finished] {
        h.jobs.create_job(record).await.unwrap();
    }
    h.jobs.start_job(&continuous.id).await.unwrap();
    h.jobs.start_job(&running.id).await.unwrap();
    h.jobs.start_job(&finished.id).await.unwrap();
    h.jobs.complete_job(&finished.id).await.unwrap();

    let report = h.manager.recover_stale_jobs().await.unwrap();
    assert_eq!(report.cancelled, vec![continuous.id.clone()]);
    let mut failed = report.failed.clone();
    failed.sort();
    let mut expected = vec![running.id.clone(), pending.id.clone()];
    expected.sort();
    assert_eq!(failed, expected);

    let c = h.jobs.get_job(&continuous.id).await.unwrap().unwrap();
    assert_eq!(c.status, JobStatus::Cancelled);
    assert!(c.cancel_reason.unwrap().contains("restarted"));
    let r = h.jobs.get_job(&running.id).await.unwrap().unwrap();
    assert_eq!(r.status, JobStatus::Failed);
    assert!(r.error.unwrap().contains("restarted"));
    let f = h.jobs.get_job(&finished.id).await.unwrap().unwrap();
    assert_eq!(f.status, JobStatus::Completed);

    assert_eq!(h.manager.recover_stale_jobs().await.unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_sweep_leaves_live_jobs_alone() {
    let feed = MockSource::new("feed", vec![item("feed", "one")]);
    let h = harness(vec![("feed", source(&feed))]);
    let id = h
        .manager
        .create_job(JobRequest::from_config(pipeline("", &["feed"], &[])))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let report = h.manager.recover_stale_jobs().await.unwrap();
    assert_eq!(report.total(), 0);
    let record = h.jobs.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Running);
    h.manager.stop_job(&id).await.unwrap();
}
