use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use marketfeed_common::SyncError;

use crate::resource::HeadroomGuard;

/// Backoff base: sleep `2^attempt` seconds between attempts.
const BACKOFF_BASE: u64 = 2;
/// Random jitter added to each backoff sleep, milliseconds.
const JITTER_MAX_MS: u64 = 500;

/// Wraps one full adapter run with bounded, backed-off retries behind
/// the resource guard.
#[derive(Debug, Clone, Copy)]
pub struct RetryController {
    max_attempts: u32,
}

impl RetryController {
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts > 0, "max_attempts must be at least 1");
        Self { max_attempts }
    }

    /// Run `op` up to `max_attempts` times. Before each attempt the
    /// resource guard is consulted; an exhausted guard aborts the
    /// whole chain without invoking the operation. Non-retryable
    /// errors (expired credentials) abort immediately. After the last
    /// failed attempt the error is logged and returned — callers treat
    /// it as "this source produced zero records this run".
    pub async fn run<T, F, Fut>(
        &self,
        source_id: &str,
        guard: &dyn HeadroomGuard,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut last_err = None;

        for attempt in 0..self.max_attempts {
            guard.wait_for_headroom().await?;

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    error!(source = source_id, error = %err, "Non-retryable failure");
                    return Err(err);
                }
                Err(err) => {
                    let remaining = self.max_attempts - attempt - 1;
                    if remaining > 0 {
                        let backoff = Duration::from_secs(BACKOFF_BASE.pow(attempt));
                        let jitter =
                            Duration::from_millis(rand::rng().random_range(0..JITTER_MAX_MS));
                        warn!(
                            source = source_id,
                            attempt = attempt + 1,
                            max_attempts = self.max_attempts,
                            backoff_secs = backoff.as_secs(),
                            error = %err,
                            "Attempt failed, retrying after backoff"
                        );
                        tokio::time::sleep(backoff + jitter).await;
                    }
                    last_err = Some(err);
                }
            }
        }

        let err = last_err.expect("at least one attempt must have run");
        error!(
            source = source_id,
            attempts = self.max_attempts,
            error = %err,
            "All attempts exhausted"
        );
        Err(err)
    }
}
