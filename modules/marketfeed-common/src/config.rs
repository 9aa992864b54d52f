use std::env;
use std::time::Duration;

/// Which persistence backend the engine writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkBackend {
    File,
    Postgres,
}

/// Engine configuration loaded from environment variables.
///
/// Malformed values panic with a clear message: configuration errors
/// are the one class allowed to abort process startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Persistence
    pub data_dir: String,
    pub sink_backend: SinkBackend,
    /// Required when `sink_backend` is Postgres.
    pub database_url: Option<String>,

    // Concurrency and retries
    pub worker_pool_size: usize,
    pub max_attempts: u32,

    // Resource guard
    pub cpu_threshold_pct: f32,
    pub mem_threshold_pct: f32,
    pub resource_check_interval: Duration,
    pub resource_max_checks: u32,

    // Traversal
    pub fetch_timeout: Duration,
    pub max_pages_per_run: u32,
    pub news_cutoff_hours: i64,

    // Job intervals and staleness thresholds (minutes)
    pub data_refresh_interval_minutes: u64,
    pub news_refresh_interval_minutes: u64,
    pub data_staleness_minutes: i64,
    pub news_staleness_minutes: i64,

    // Remote rendering service
    pub render_url: Option<String>,
    pub render_token: Option<String>,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// the defaults the original deployment ran with.
    pub fn from_env() -> Self {
        let sink_backend = match env::var("SINK_BACKEND").as_deref() {
            Ok("postgres") => SinkBackend::Postgres,
            Ok("file") | Err(_) => SinkBackend::File,
            Ok(other) => panic!("SINK_BACKEND must be \"file\" or \"postgres\", got {other:?}"),
        };

        let database_url = env::var("DATABASE_URL").ok();
        if sink_backend == SinkBackend::Postgres && database_url.is_none() {
            panic!("DATABASE_URL is required when SINK_BACKEND=postgres");
        }

        Self {
            data_dir: env::var("MARKETFEED_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            sink_backend,
            database_url,
            worker_pool_size: parsed_env("WORKER_POOL_SIZE", 2),
            max_attempts: parsed_env("MAX_ATTEMPTS", 3),
            cpu_threshold_pct: parsed_env("CPU_THRESHOLD_PCT", 80.0),
            mem_threshold_pct: parsed_env("MEM_THRESHOLD_PCT", 85.0),
            resource_check_interval: Duration::from_secs(parsed_env(
                "RESOURCE_CHECK_INTERVAL_SECS",
                5,
            )),
            resource_max_checks: parsed_env("RESOURCE_MAX_CHECKS", 5),
            fetch_timeout: Duration::from_secs(parsed_env("FETCH_TIMEOUT_SECS", 30)),
            max_pages_per_run: parsed_env("MAX_PAGES_PER_RUN", 50),
            news_cutoff_hours: parsed_env("NEWS_CUTOFF_HOURS", 24),
            data_refresh_interval_minutes: parsed_env("DATA_REFRESH_INTERVAL", 180),
            news_refresh_interval_minutes: parsed_env("NEWS_REFRESH_INTERVAL", 10),
            data_staleness_minutes: parsed_env("DATA_THRESHOLD", 180),
            news_staleness_minutes: parsed_env("NEWS_THRESHOLD", 10),
            render_url: env::var("RENDER_URL").ok(),
            render_token: env::var("RENDER_TOKEN").ok(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            sink_backend: SinkBackend::File,
            database_url: None,
            worker_pool_size: 2,
            max_attempts: 3,
            cpu_threshold_pct: 80.0,
            mem_threshold_pct: 85.0,
            resource_check_interval: Duration::from_secs(5),
            resource_max_checks: 5,
            fetch_timeout: Duration::from_secs(30),
            max_pages_per_run: 50,
            news_cutoff_hours: 24,
            data_refresh_interval_minutes: 180,
            news_refresh_interval_minutes: 10,
            data_staleness_minutes: 180,
            news_staleness_minutes: 10,
            render_url: None,
            render_token: None,
        }
    }
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a valid number: {e}")),
        Err(_) => default,
    }
}
