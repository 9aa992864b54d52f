use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;

use marketfeed_common::{CandidateRecord, SyncError};
use render_client::RenderError;

use crate::filter::RecordFilter;

/// The only per-site-specific seam in the engine.
///
/// An adapter knows how to fetch one page (or scroll increment) of its
/// source and parse the markup into candidate records, newest first as
/// the source delivers them. Everything else — iteration, stop
/// conditions, filtering, retries, persistence — is generic.
///
/// Adapters that drive a rendering session own that session for the
/// duration of one run; sessions are never shared across concurrent
/// tasks.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier for logs and run reports ("moneycontrol",
    /// "bse_bulk", ...).
    fn source_id(&self) -> &str;

    /// Logical store this source's records land in
    /// ("news_repository", "bulk_deals", ...).
    fn store(&self) -> &str;

    /// Fetch the markup (or API payload) of one page. Pages are
    /// 1-based. Sources without page semantics ignore the argument and
    /// deliver everything on page 1.
    async fn fetch_page(&self, page: u32) -> Result<String, SyncError>;

    /// Parse one page into candidate records in delivered order.
    /// A page that parses to zero records signals end of content.
    fn parse_page(&self, markup: &str) -> Result<Vec<CandidateRecord>, SyncError>;
}

/// An adapter bundled with its run policy: how records are filtered
/// and how far back in time the traversal reaches.
#[derive(Clone)]
pub struct SourceSpec {
    pub adapter: Arc<dyn SourceAdapter>,
    pub filter: RecordFilter,
    /// Records older than `now - freshness_window` stop the traversal.
    /// `None` means no age cutoff (deal reports republish a fixed
    /// window and rely on key dedup alone).
    pub freshness_window: Option<Duration>,
}

impl SourceSpec {
    pub fn new(adapter: Arc<dyn SourceAdapter>) -> Self {
        Self {
            adapter,
            filter: RecordFilter::All,
            freshness_window: None,
        }
    }

    pub fn with_filter(mut self, filter: RecordFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = Some(window);
        self
    }
}

/// Map a rendering-service failure onto the engine taxonomy. Adapter
/// implementations call this so a selector-wait timeout is retried and
/// then skipped, rather than treated as a permanent source defect.
pub fn render_error_to_sync(err: RenderError) -> SyncError {
    match err {
        RenderError::WaitTimeout(msg) => SyncError::RenderTimeout(msg),
        RenderError::Network(msg) => SyncError::TransientFetch(msg),
        RenderError::Api { status, message } => {
            SyncError::TransientFetch(format!("render API status {status}: {message}"))
        }
    }
}
