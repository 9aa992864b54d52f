//! Integration tests for the full sync pipeline: adapters through
//! traversal, retries, the file sink, and the scheduler.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use marketfeed_common::{CandidateRecord, EngineConfig, SyncError};
use marketfeed_engine::{
    FileSink, GroupRunner, JobScheduler, JobSpec, RecordFilter, ResourceGuard, ResourceSample,
    ResourceSampler, RetryController, Sink, SourceAdapter, SourceSpec, TaxonomyMap,
    TraversalController,
};

// ---------------------------------------------------------------------------
// Test adapters
// ---------------------------------------------------------------------------

struct IdleSampler;

impl ResourceSampler for IdleSampler {
    fn sample(&mut self) -> ResourceSample {
        ResourceSample {
            cpu_pct: 10.0,
            mem_pct: 30.0,
        }
    }
}

/// A news-like source: two pages of articles, newest first, carrying
/// raw category labels that the taxonomy filter rewrites.
struct NewsSite {
    fetches: AtomicU32,
}

impl NewsSite {
    fn new() -> Self {
        Self {
            fetches: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SourceAdapter for NewsSite {
    fn source_id(&self) -> &str {
        "newsfeed"
    }

    fn store(&self) -> &str {
        "news_repository"
    }

    async fn fetch_page(&self, page: u32) -> Result<String, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(page.to_string())
    }

    fn parse_page(&self, markup: &str) -> Result<Vec<CandidateRecord>, SyncError> {
        let now = Utc::now();
        let article = |key: &str, age_hours: i64, category: &str| {
            CandidateRecord::new("newsfeed", key, now - ChronoDuration::hours(age_hours))
                .with_categories(vec![category.to_string()])
                .with_field("headline", serde_json::json!(format!("story {key}")))
        };
        match markup {
            "1" => Ok(vec![
                article("https://news.example/a1", 1, "banking"),
                article("https://news.example/a2", 2, "equity"),
            ]),
            "2" => Ok(vec![article("https://news.example/a3", 5, "ipos")]),
            _ => Ok(Vec::new()),
        }
    }
}

/// A deal-report source that fails a fixed number of times before
/// recovering, to exercise the retry chain end to end.
struct FlakyDeals {
    failures_left: AtomicU32,
}

impl FlakyDeals {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl SourceAdapter for FlakyDeals {
    fn source_id(&self) -> &str {
        "bulk_deals"
    }

    fn store(&self) -> &str {
        "bulk_deals"
    }

    async fn fetch_page(&self, page: u32) -> Result<String, SyncError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::TransientFetch("gateway timeout".into()));
        }
        Ok(page.to_string())
    }

    fn parse_page(&self, markup: &str) -> Result<Vec<CandidateRecord>, SyncError> {
        if markup == "1" {
            Ok(vec![CandidateRecord::new(
                "bulk_deals",
                "bse|2025-06-30|ACME|FII Alpha|BUY|100000|12.5",
                Utc::now(),
            )])
        } else {
            Ok(Vec::new())
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn file_sink(dir: &Path) -> Arc<FileSink> {
    Arc::new(FileSink::new(dir, ["news_repository", "bulk_deals"]).expect("create sink"))
}

fn runner(sink: Arc<FileSink>) -> Arc<GroupRunner> {
    Arc::new(GroupRunner::new(
        sink,
        Arc::new(ResourceGuard::from_config(
            &EngineConfig::default(),
            IdleSampler,
        )),
        RetryController::new(3),
        TraversalController::new(10, Duration::from_secs(5)),
        2,
    ))
}

fn news_spec(adapter: Arc<NewsSite>) -> SourceSpec {
    SourceSpec::new(adapter)
        .with_filter(RecordFilter::Taxonomy(TaxonomyMap::default()))
        .with_freshness_window(ChronoDuration::hours(24))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn first_run_ingests_second_run_stops_at_known_keys() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let sink = file_sink(dir.path());
    let runner = runner(sink.clone());

    let news = Arc::new(NewsSite::new());
    let specs = vec![news_spec(news.clone())];

    let first = runner.run("news", &specs).await;
    assert_eq!(first.total_inserted(), 3);

    let keys = sink.known_keys("news_repository").await?;
    assert_eq!(keys.len(), 3);

    // Second run sees a1 first, stops immediately, inserts nothing,
    // and never requests page two.
    let fetched_before = news.fetches.load(Ordering::SeqCst);
    let second = runner.run("news", &specs).await;
    assert_eq!(second.total_inserted(), 0);
    assert_eq!(news.fetches.load(Ordering::SeqCst), fetched_before + 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn taxonomy_rewrites_categories_on_the_way_in() {
    let dir = tempfile::tempdir().unwrap();
    let sink = file_sink(dir.path());
    let runner = runner(sink.clone());

    let report = runner
        .run("news", &[news_spec(Arc::new(NewsSite::new()))])
        .await;
    assert_eq!(report.succeeded(), 1);

    let raw = std::fs::read_to_string(dir.path().join("news_repository.jsonl")).unwrap();
    // "banking" and "equity" are special words; "ipos" matches a
    // priority category by its singular form.
    assert!(raw.contains("\"Finance\""));
    assert!(raw.contains("\"Markets\""));
    assert!(raw.contains("\"IPOs\""));
    assert!(!raw.contains("\"banking\""));
}

#[tokio::test(start_paused = true)]
async fn flaky_source_recovers_within_its_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let sink = file_sink(dir.path());
    let runner = runner(sink.clone());

    // Two failures, three attempts: the third lands the record.
    let specs = vec![SourceSpec::new(Arc::new(FlakyDeals::new(2)))];
    let report = runner.run("data", &specs).await;

    assert_eq!(report.failed(), 0);
    assert_eq!(report.total_inserted(), 1);
    assert!(sink
        .known_keys("bulk_deals")
        .await
        .unwrap()
        .iter()
        .any(|k| k.starts_with("bse|2025-06-30|ACME")));
}

#[tokio::test(start_paused = true)]
async fn mixed_group_isolates_the_exhausted_source() {
    let dir = tempfile::tempdir().unwrap();
    let sink = file_sink(dir.path());
    let runner = runner(sink.clone());

    // Four failures exceed the three-attempt budget.
    let specs = vec![
        news_spec(Arc::new(NewsSite::new())),
        SourceSpec::new(Arc::new(FlakyDeals::new(4))),
    ];
    let report = runner.run("mixed", &specs).await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.inserted_by_store["news_repository"], 3);
    assert!(sink.known_keys("bulk_deals").await.unwrap().is_empty());
    assert!(!report.all_failed());
}

#[tokio::test(start_paused = true)]
async fn scheduler_runs_stale_jobs_then_keeps_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let sink = file_sink(dir.path());
    let scheduler = Arc::new(JobScheduler::new(
        runner(sink.clone()),
        dir.path().join("sync_state.json"),
    ));

    let news = Arc::new(NewsSite::new());
    scheduler
        .register(
            JobSpec::new("news", vec![news_spec(news.clone())])
                .with_interval(Duration::from_secs(600))
                .with_staleness(ChronoDuration::minutes(10)),
        )
        .await;

    // Never run before: the catch-up pass runs it immediately.
    let stale = scheduler.catch_up_stale().await;
    assert_eq!(stale, vec!["news".to_string()]);
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sink.known_keys("news_repository").await.unwrap().len(), 3);

    let status = scheduler.status().await;
    assert!(status["news"].last_success_at.is_some());
    assert_eq!(status["news"].consecutive_failures, 0);

    // On cadence, the next run finds only known keys and adds nothing.
    scheduler.start().await;
    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    assert_eq!(sink.known_keys("news_repository").await.unwrap().len(), 3);
    scheduler.shutdown().await;
}
