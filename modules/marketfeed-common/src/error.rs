use thiserror::Error;

/// Error taxonomy for one synchronization run.
///
/// Adapter- and attempt-level errors are contained by the retry layer
/// and never escape the group runner; a failed source simply
/// contributes zero records for that run. Only `Config` is allowed to
/// abort process startup.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network failure or HTTP-level error while fetching a page.
    /// Retried.
    #[error("transient fetch error: {0}")]
    TransientFetch(String),

    /// A rendering/automation wait exceeded its timeout. Retried, then
    /// the source is skipped for this run.
    #[error("render timeout: {0}")]
    RenderTimeout(String),

    /// Expected markup structure was absent. Adapters skip individual
    /// malformed records inside `parse_page` themselves; a `ParseShape`
    /// that propagates out of an adapter fails the whole page and goes
    /// through the retry chain like any other retryable error.
    #[error("parse shape error: {0}")]
    ParseShape(String),

    /// Natural-key collision at the sink boundary. Expected under
    /// concurrent ingestion and absorbed as zero-effect; sinks return
    /// this only when a constraint violation escapes the
    /// insert-if-absent path.
    #[error("duplicate natural key: {0}")]
    DuplicateKey(String),

    /// The resource guard found CPU/memory over threshold for the
    /// configured number of checks. Aborts the attempt chain for one
    /// source only.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// OAuth/session credentials need manual re-authentication. Never
    /// retried automatically.
    #[error("credential expired: {0}")]
    CredentialExpired(String),

    /// Sink-level I/O or database failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Malformed configuration, e.g. an unknown store name. The one
    /// class that may propagate to startup.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the retry controller should attempt again after this
    /// error. Credential and resource failures abort the chain.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::CredentialExpired(_)
                | SyncError::ResourceExhaustion(_)
                | SyncError::Config(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
