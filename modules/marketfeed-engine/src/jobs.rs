use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use marketfeed_common::{EngineConfig, SyncError, SyncState};

use crate::adapter::SourceSpec;
use crate::group::GroupRunner;
use crate::stats::GroupReport;

/// A named group of sources with its run cadence.
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub specs: Vec<SourceSpec>,
    /// Timer cadence once the job is enabled.
    pub interval: Duration,
    /// Age of the last success beyond which a catch-up pass runs the
    /// job immediately instead of waiting for the next tick.
    pub staleness: chrono::Duration,
    pub enabled: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, specs: Vec<SourceSpec>) -> Self {
        Self {
            name: name.into(),
            specs,
            interval: Duration::from_secs(180 * 60),
            staleness: chrono::Duration::minutes(180),
            enabled: true,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_staleness(mut self, staleness: chrono::Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Cadence and staleness for a slow-moving data job (deal reports,
    /// reference data) from config.
    pub fn data_cadence(mut self, config: &EngineConfig) -> Self {
        self.interval = Duration::from_secs(config.data_refresh_interval_minutes * 60);
        self.staleness = chrono::Duration::minutes(config.data_staleness_minutes);
        self
    }

    /// Cadence and staleness for a fast news job from config.
    pub fn news_cadence(mut self, config: &EngineConfig) -> Self {
        self.interval = Duration::from_secs(config.news_refresh_interval_minutes * 60);
        self.staleness = chrono::Duration::minutes(config.news_staleness_minutes);
        self
    }
}

/// Operator-facing view of one job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub enabled: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

struct JobEntry {
    spec: JobSpec,
    state: SyncState,
    timer: Option<AbortHandle>,
}

/// Interval scheduler with staleness catch-up.
///
/// Each registered job runs on its own timer; sync state (last success,
/// failure streak, enabled flag) is persisted as JSON next to the data
/// so a restart picks up where the process left off. A run in which
/// every source failed does not advance `last_success_at` — the job
/// stays stale and the next catch-up pass retries it.
pub struct JobScheduler {
    runner: Arc<GroupRunner>,
    state_path: PathBuf,
    jobs: Mutex<BTreeMap<String, JobEntry>>,
}

impl JobScheduler {
    pub fn new(runner: Arc<GroupRunner>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            state_path: state_path.into(),
            jobs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a job, merging in any persisted state for its name.
    /// The persisted enabled flag wins over the spec's, so operator
    /// toggles survive restarts.
    pub async fn register(&self, spec: JobSpec) {
        let persisted = load_states(&self.state_path);
        let state = persisted
            .get(&spec.name)
            .cloned()
            .unwrap_or_else(|| SyncState {
                enabled: spec.enabled,
                ..SyncState::default()
            });
        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            spec.name.clone(),
            JobEntry {
                spec,
                state,
                timer: None,
            },
        );
    }

    /// Start timers for every enabled job. The first run of each job
    /// happens one interval after start; use [`catch_up_stale`] for
    /// immediate backfill.
    ///
    /// [`catch_up_stale`]: JobScheduler::catch_up_stale
    pub async fn start(self: &Arc<Self>) {
        let mut jobs = self.jobs.lock().await;
        let names: Vec<(String, Duration, bool)> = jobs
            .values()
            .map(|e| (e.spec.name.clone(), e.spec.interval, e.state.enabled))
            .collect();
        for (name, interval, enabled) in names {
            if !enabled {
                continue;
            }
            if let Some(entry) = jobs.get_mut(&name) {
                if entry.timer.is_none() {
                    entry.timer = Some(self.spawn_timer(name.clone(), interval));
                    info!(job = name, interval_secs = interval.as_secs(), "Job timer started");
                }
            }
        }
    }

    /// Stop all timers. In-flight runs finish on their own.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for entry in jobs.values_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }

    /// Enable or disable a job. Disabling aborts its timer; enabling
    /// starts one. Unknown names are a config error.
    pub async fn toggle(self: &Arc<Self>, name: &str, enabled: bool) -> Result<(), SyncError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(name)
            .ok_or_else(|| SyncError::Config(format!("unknown job {name:?}")))?;

        entry.state.enabled = enabled;
        if enabled {
            if entry.timer.is_none() {
                entry.timer = Some(self.spawn_timer(name.to_string(), entry.spec.interval));
            }
        } else if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        info!(job = name, enabled, "Job toggled");

        // Persist under the lock so racing toggles cannot write their
        // snapshots out of order.
        let states = snapshot_states(&jobs);
        persist_states(&self.state_path, &states)
    }

    pub async fn enable(self: &Arc<Self>, name: &str) -> Result<(), SyncError> {
        self.toggle(name, true).await
    }

    pub async fn disable(self: &Arc<Self>, name: &str) -> Result<(), SyncError> {
        self.toggle(name, false).await
    }

    /// Run a job right now, regardless of its timer or enabled flag.
    pub async fn trigger(&self, name: &str) -> Result<GroupReport, SyncError> {
        {
            let jobs = self.jobs.lock().await;
            if !jobs.contains_key(name) {
                return Err(SyncError::Config(format!("unknown job {name:?}")));
            }
        }
        self.run_job(name).await
    }

    /// Spawn immediate runs for every enabled job whose last success is
    /// missing or older than its staleness threshold. Returns the names
    /// of the jobs kicked off; the runs proceed in the background.
    pub async fn catch_up_stale(self: &Arc<Self>) -> Vec<String> {
        let now = Utc::now();
        let jobs = self.jobs.lock().await;
        let stale: Vec<String> = jobs
            .values()
            .filter(|e| e.state.enabled)
            .filter(|e| match e.state.last_success_at {
                None => true,
                Some(at) => now - at > e.spec.staleness,
            })
            .map(|e| e.spec.name.clone())
            .collect();
        drop(jobs);

        for name in &stale {
            info!(job = name, "Stale job, running catch-up");
            let scheduler = Arc::clone(self);
            let name = name.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler.run_job(&name).await {
                    warn!(job = name, error = %err, "Catch-up run failed");
                }
            });
        }
        stale
    }

    pub async fn status(&self) -> BTreeMap<String, JobStatus> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    JobStatus {
                        enabled: entry.state.enabled,
                        last_success_at: entry.state.last_success_at,
                        consecutive_failures: entry.state.consecutive_failures,
                    },
                )
            })
            .collect()
    }

    fn spawn_timer(self: &Arc<Self>, name: String, interval: Duration) -> AbortHandle {
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; consume it so the job
            // starts one full interval after enablement.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = scheduler.run_job(&name).await {
                    warn!(job = name, error = %err, "Scheduled run failed");
                }
            }
        });
        handle.abort_handle()
    }

    async fn run_job(&self, name: &str) -> Result<GroupReport, SyncError> {
        let specs: Vec<SourceSpec> = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(name)
                .ok_or_else(|| SyncError::Config(format!("unknown job {name:?}")))?;
            entry.spec.specs.clone()
        };

        let report = self.runner.run(name, &specs).await;

        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(name) {
            if report.all_failed() {
                entry.state.consecutive_failures += 1;
                warn!(
                    job = name,
                    consecutive_failures = entry.state.consecutive_failures,
                    "Run produced no successful source"
                );
            } else {
                entry.state.last_success_at = Some(Utc::now());
                entry.state.consecutive_failures = 0;
            }
        }
        let states = snapshot_states(&jobs);
        persist_states(&self.state_path, &states)?;
        drop(jobs);

        Ok(report)
    }
}

fn snapshot_states(jobs: &BTreeMap<String, JobEntry>) -> BTreeMap<String, SyncState> {
    jobs.iter()
        .map(|(name, entry)| (name.clone(), entry.state.clone()))
        .collect()
}

fn load_states(path: &Path) -> BTreeMap<String, SyncState> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(states) => states,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Ignoring malformed state file");
            BTreeMap::new()
        }
    }
}

fn persist_states(path: &Path, states: &BTreeMap<String, SyncState>) -> Result<(), SyncError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, states)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| SyncError::Storage(format!("persist {}: {}", path.display(), e.error)))?;
    Ok(())
}
