use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use marketfeed_common::EngineConfig;

use crate::adapter::SourceSpec;
use crate::resource::HeadroomGuard;
use crate::retry::RetryController;
use crate::sink::Sink;
use crate::stats::{GroupReport, SourceOutcome};
use crate::traversal::TraversalController;

/// Runs a group of sources concurrently under a worker cap, each
/// wrapped in its own retry chain. Failure is isolated per source: one
/// source exhausting its retries (or panicking) never prevents the
/// others from running and persisting. After all sources finish, every
/// store the group writes to is compacted once.
pub struct GroupRunner {
    sink: Arc<dyn Sink>,
    guard: Arc<dyn HeadroomGuard>,
    retry: RetryController,
    traversal: TraversalController,
    workers: usize,
}

impl GroupRunner {
    pub fn new(
        sink: Arc<dyn Sink>,
        guard: Arc<dyn HeadroomGuard>,
        retry: RetryController,
        traversal: TraversalController,
        workers: usize,
    ) -> Self {
        assert!(workers > 0, "worker pool must have at least one slot");
        Self {
            sink,
            guard,
            retry,
            traversal,
            workers,
        }
    }

    pub fn from_config(
        sink: Arc<dyn Sink>,
        guard: Arc<dyn HeadroomGuard>,
        config: &EngineConfig,
    ) -> Self {
        Self::new(
            sink,
            guard,
            RetryController::new(config.max_attempts),
            TraversalController::from_config(config),
            config.worker_pool_size,
        )
    }

    pub async fn run(&self, group: &str, specs: &[SourceSpec]) -> GroupReport {
        info!(group, sources = specs.len(), workers = self.workers, "Group run starting");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();
        // Task id -> (spec index, source, store), so panics can still be
        // attributed to the source that raised them.
        let mut task_meta: HashMap<tokio::task::Id, (usize, String, String)> = HashMap::new();

        for (index, spec) in specs.iter().enumerate() {
            let spec = spec.clone();
            let sink = Arc::clone(&self.sink);
            let guard = Arc::clone(&self.guard);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.retry;
            let traversal = self.traversal;
            let source_id = spec.adapter.source_id().to_string();
            let store = spec.adapter.store().to_string();

            let meta = (index, source_id.clone(), store.clone());
            let handle = join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore is never closed");
                let result = retry
                    .run(&source_id, guard.as_ref(), || {
                        traversal.run(&spec, sink.as_ref())
                    })
                    .await;

                match result {
                    Ok(outcome) => SourceOutcome {
                        source_id,
                        store,
                        accepted: outcome.accepted.len() as u64,
                        inserted: outcome.inserted,
                        pages: outcome.pages,
                        drained: outcome.drained,
                        error: None,
                    },
                    Err(err) => SourceOutcome {
                        source_id,
                        store,
                        accepted: 0,
                        inserted: 0,
                        pages: 0,
                        drained: false,
                        error: Some(err.to_string()),
                    },
                }
            });
            task_meta.insert(handle.id(), meta);
        }

        let mut outcomes: Vec<(usize, SourceOutcome)> = Vec::with_capacity(specs.len());
        while let Some(joined) = join_set.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    let (index, _, _) = task_meta
                        .remove(&id)
                        .unwrap_or((usize::MAX, String::new(), String::new()));
                    outcomes.push((index, outcome));
                }
                Err(join_err) => {
                    let (index, source_id, store) = task_meta
                        .remove(&join_err.id())
                        .unwrap_or((usize::MAX, "unknown".into(), "unknown".into()));
                    warn!(group, source = source_id, error = %join_err, "Source task panicked");
                    outcomes.push((
                        index,
                        SourceOutcome {
                            source_id,
                            store,
                            accepted: 0,
                            inserted: 0,
                            pages: 0,
                            drained: false,
                            error: Some(format!("worker panicked: {join_err}")),
                        },
                    ));
                }
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        let mut report = GroupReport {
            group: group.to_string(),
            ..Default::default()
        };
        for (_, outcome) in outcomes {
            *report
                .inserted_by_store
                .entry(outcome.store.clone())
                .or_insert(0) += outcome.inserted;
            report.outcomes.push(outcome);
        }

        let stores: BTreeSet<String> =
            report.outcomes.iter().map(|o| o.store.clone()).collect();
        for store in stores {
            match self.sink.compact(&store).await {
                Ok(removed) => {
                    if removed > 0 {
                        report.compacted_by_store.insert(store, removed);
                    }
                }
                Err(err) => warn!(group, store, error = %err, "Compaction failed"),
            }
        }

        info!(
            group,
            succeeded = report.succeeded(),
            failed = report.failed(),
            inserted = report.total_inserted(),
            "Group run finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use marketfeed_common::{CandidateRecord, SyncError};

    use crate::adapter::SourceAdapter;
    use crate::resource::{ResourceGuard, ResourceSample, ResourceSampler};
    use crate::sink::FileSink;

    struct IdleSampler;
    impl ResourceSampler for IdleSampler {
        fn sample(&mut self) -> ResourceSample {
            ResourceSample {
                cpu_pct: 5.0,
                mem_pct: 20.0,
            }
        }
    }

    /// One page of one record, then end of content.
    struct OneShotAdapter {
        source_id: String,
        store: String,
        key: String,
    }

    #[async_trait]
    impl SourceAdapter for OneShotAdapter {
        fn source_id(&self) -> &str {
            &self.source_id
        }
        fn store(&self) -> &str {
            &self.store
        }
        async fn fetch_page(&self, page: u32) -> Result<String, SyncError> {
            Ok(page.to_string())
        }
        fn parse_page(&self, markup: &str) -> Result<Vec<CandidateRecord>, SyncError> {
            if markup == "1" {
                Ok(vec![CandidateRecord::new(&self.source_id, &self.key, Utc::now())])
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct AlwaysDownAdapter {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SourceAdapter for AlwaysDownAdapter {
        fn source_id(&self) -> &str {
            "always_down"
        }
        fn store(&self) -> &str {
            "bulk_deals"
        }
        async fn fetch_page(&self, _page: u32) -> Result<String, SyncError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::TransientFetch("connection refused".into()))
        }
        fn parse_page(&self, _markup: &str) -> Result<Vec<CandidateRecord>, SyncError> {
            unreachable!("fetch never succeeds")
        }
    }

    struct PanickingAdapter;

    #[async_trait]
    impl SourceAdapter for PanickingAdapter {
        fn source_id(&self) -> &str {
            "panicker"
        }
        fn store(&self) -> &str {
            "bulk_deals"
        }
        async fn fetch_page(&self, _page: u32) -> Result<String, SyncError> {
            panic!("adapter bug")
        }
        fn parse_page(&self, _markup: &str) -> Result<Vec<CandidateRecord>, SyncError> {
            Ok(Vec::new())
        }
    }

    fn runner(sink: Arc<dyn Sink>, workers: usize) -> GroupRunner {
        GroupRunner::new(
            sink,
            Arc::new(ResourceGuard::from_config(
                &EngineConfig::default(),
                IdleSampler,
            )),
            RetryController::new(3),
            TraversalController::new(5, Duration::from_secs(5)),
            workers,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_source_does_not_block_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(
            FileSink::new(dir.path(), ["news_repository", "bulk_deals"]).unwrap(),
        );
        let attempts = Arc::new(AtomicUsize::new(0));

        let specs = vec![
            SourceSpec::new(Arc::new(OneShotAdapter {
                source_id: "healthy".into(),
                store: "news_repository".into(),
                key: "N1".into(),
            })),
            SourceSpec::new(Arc::new(AlwaysDownAdapter {
                attempts: attempts.clone(),
            })),
        ];

        let report = runner(sink.clone(), 2).run("mixed", &specs).await;

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        // The failing source went through its full retry chain.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // The healthy source's record landed regardless.
        assert!(sink
            .known_keys("news_repository")
            .await
            .unwrap()
            .contains("N1"));
        assert!(!report.all_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn a_panicking_adapter_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(
            FileSink::new(dir.path(), ["news_repository", "bulk_deals"]).unwrap(),
        );

        let specs = vec![
            SourceSpec::new(Arc::new(PanickingAdapter)),
            SourceSpec::new(Arc::new(OneShotAdapter {
                source_id: "healthy".into(),
                store: "news_repository".into(),
                key: "N2".into(),
            })),
        ];

        let report = runner(sink.clone(), 2).run("mixed", &specs).await;

        assert_eq!(report.failed(), 1);
        let panicked = report
            .outcomes
            .iter()
            .find(|o| o.source_id == "panicker")
            .unwrap();
        assert!(panicked.error.as_deref().unwrap().contains("panicked"));
        assert!(sink
            .known_keys("news_repository")
            .await
            .unwrap()
            .contains("N2"));
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_keep_the_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path(), ["news_repository"]).unwrap());

        let specs: Vec<SourceSpec> = (0..4)
            .map(|i| {
                SourceSpec::new(Arc::new(OneShotAdapter {
                    source_id: format!("source_{i}"),
                    store: "news_repository".into(),
                    key: format!("K{i}"),
                }))
            })
            .collect();

        let report = runner(sink, 2).run("ordered", &specs).await;
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.source_id.as_str()).collect();
        assert_eq!(ids, vec!["source_0", "source_1", "source_2", "source_3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn identical_sources_stay_idempotent_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileSink::new(dir.path(), ["news_repository"]).unwrap());

        // Two sources delivering the same key; exactly one insert wins.
        let specs: Vec<SourceSpec> = (0..2)
            .map(|i| {
                SourceSpec::new(Arc::new(OneShotAdapter {
                    source_id: format!("mirror_{i}"),
                    store: "news_repository".into(),
                    key: "SAME".into(),
                }))
            })
            .collect();

        let report = runner(sink.clone(), 2).run("mirrors", &specs).await;
        assert_eq!(report.total_inserted(), 1);
        assert_eq!(sink.known_keys("news_repository").await.unwrap().len(), 1);
    }
}
