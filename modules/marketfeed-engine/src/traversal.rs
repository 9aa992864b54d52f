use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use marketfeed_common::{CandidateRecord, EngineConfig, PersistedRecord, SyncError};

use crate::adapter::SourceSpec;
use crate::sink::Sink;

/// Drives page/scroll iteration over one source until a stop predicate
/// fires.
///
/// The stop signal is global to the run, not per-page: a duplicate or
/// stale record anywhere in a page halts the whole traversal, because
/// sources are assumed append-only at the head. A live site that
/// re-surfaces an edited article ahead of genuinely new items will
/// therefore cause those items to be skipped until they reappear —
/// a known trade-off carried over deliberately, not an oversight.
#[derive(Debug, Clone, Copy)]
pub struct TraversalController {
    /// Hard ceiling on pages per run; guards against infinite-scroll
    /// sources that never signal an end.
    max_pages: u32,
    /// Budget for one fetch step, so a hung source cannot block its
    /// worker indefinitely.
    fetch_timeout: Duration,
}

/// What one traversal produced.
#[derive(Debug)]
pub struct TraversalOutcome {
    /// Accepted records in traversal order (newest first).
    pub accepted: Vec<CandidateRecord>,
    /// How many of those the sink actually inserted.
    pub inserted: u64,
    /// Pages fetched before stopping.
    pub pages: u32,
    /// True when the source ran out of content; false when the stop
    /// predicate or the page ceiling ended the run early.
    pub drained: bool,
}

impl TraversalController {
    pub fn new(max_pages: u32, fetch_timeout: Duration) -> Self {
        Self {
            max_pages,
            fetch_timeout,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.max_pages_per_run, config.fetch_timeout)
    }

    /// Run one full traversal of `spec`'s source, inserting each
    /// page's accepted batch through the sink before fetching the
    /// next page. Fetch/parse failures propagate to the retry layer;
    /// the traversal itself never retries.
    pub async fn run(
        &self,
        spec: &SourceSpec,
        sink: &dyn Sink,
    ) -> Result<TraversalOutcome, SyncError> {
        let adapter = spec.adapter.as_ref();
        let source = adapter.source_id();
        let store = adapter.store();
        let cutoff = spec.freshness_window.map(|window| Utc::now() - window);

        let mut known = sink.known_keys(store).await?;
        let mut accepted: Vec<CandidateRecord> = Vec::new();
        let mut inserted = 0u64;
        let mut pages = 0u32;
        let mut drained = false;
        let mut stopped = false;

        for page in 1..=self.max_pages {
            let markup = tokio::time::timeout(self.fetch_timeout, adapter.fetch_page(page))
                .await
                .map_err(|_| {
                    SyncError::RenderTimeout(format!(
                        "{source}: page {page} fetch exceeded {}s",
                        self.fetch_timeout.as_secs()
                    ))
                })??;
            pages = page;

            let records = adapter.parse_page(&markup)?;
            if records.is_empty() {
                drained = true;
                break;
            }

            let mut page_accepted: Vec<CandidateRecord> = Vec::new();
            for record in records {
                if known.contains(&record.natural_key) {
                    debug!(source, key = %record.natural_key, "Known key, stopping traversal");
                    stopped = true;
                    break;
                }
                if let Some(cutoff) = cutoff {
                    if record.observed_at < cutoff {
                        debug!(source, observed_at = %record.observed_at,
                            "Record older than cutoff, stopping traversal");
                        stopped = true;
                        break;
                    }
                }
                let Some(record) = spec.filter.apply(record) else {
                    continue;
                };
                known.insert(record.natural_key.clone());
                page_accepted.push(record);
            }

            if !page_accepted.is_empty() {
                let batch: Vec<PersistedRecord> = page_accepted
                    .iter()
                    .cloned()
                    .map(PersistedRecord::from)
                    .collect();
                inserted += sink.insert_if_absent(store, &batch).await?;
                accepted.extend(page_accepted);
            }

            if stopped {
                break;
            }
        }

        info!(
            source,
            store,
            pages,
            accepted = accepted.len(),
            inserted,
            drained,
            "Traversal finished"
        );

        Ok(TraversalOutcome {
            accepted,
            inserted,
            pages,
            drained,
        })
    }
}
