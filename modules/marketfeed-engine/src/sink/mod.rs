mod file;
mod postgres;

pub use file::FileSink;
pub use postgres::PgSink;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use marketfeed_common::{EngineConfig, PersistedRecord, SinkBackend, SyncError};

/// Idempotent, lock-protected persistence boundary.
///
/// Implementations must be safe for concurrent callers targeting the
/// same store (serialized per store) and for callers targeting
/// different stores (no cross-store blocking). `insert_if_absent` is
/// commutative and idempotent: final persisted state is independent of
/// task completion order and of re-running the same batch twice.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Snapshot of the natural keys currently in a store. Traversals
    /// take this once at the start of a run.
    async fn known_keys(&self, store: &str) -> Result<HashSet<String>, SyncError>;

    /// Insert records whose natural keys are not yet present. Returns
    /// how many were actually inserted; re-insertion of an existing
    /// key is a no-op, never an update.
    async fn insert_if_absent(
        &self,
        store: &str,
        records: &[PersistedRecord],
    ) -> Result<u64, SyncError>;

    /// Maintenance pass: full-store duplicate removal plus a stable
    /// newest-first sort by a date-like column. Not on the hot path;
    /// the group runner invokes it once per affected store after a
    /// run. Returns the number of duplicate records removed.
    async fn compact(&self, store: &str) -> Result<u64, SyncError>;
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sink")
    }
}

/// Build the sink the configuration selects. `stores` is the full set
/// of logical store names the deployment writes to; the file backend
/// builds its lock map from it once, up front.
pub async fn from_config<S: Into<String>>(
    config: &EngineConfig,
    stores: impl IntoIterator<Item = S>,
) -> Result<Arc<dyn Sink>, SyncError> {
    match config.sink_backend {
        SinkBackend::File => Ok(Arc::new(FileSink::new(&config.data_dir, stores)?)),
        SinkBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| SyncError::Config("DATABASE_URL is not set".into()))?;
            Ok(Arc::new(PgSink::connect(url).await?))
        }
    }
}
