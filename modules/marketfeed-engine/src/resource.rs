use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tracing::warn;

use marketfeed_common::{EngineConfig, SyncError};

/// One CPU/memory utilization sample, in percent.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_pct: f32,
    pub mem_pct: f32,
}

/// Seam for utilization sampling so the guard is testable without a
/// loaded machine.
pub trait ResourceSampler: Send + Sync {
    fn sample(&mut self) -> ResourceSample;
}

/// Process-wide sampler backed by sysinfo. CPU percentages need two
/// refreshes a short interval apart; the guard's check interval
/// provides that spacing after the first call.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        let cpu_pct = self.system.global_cpu_usage();
        let total = self.system.total_memory();
        let mem_pct = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f32 / total as f32 * 100.0
        };
        ResourceSample { cpu_pct, mem_pct }
    }
}

/// Object-safe face of the guard, so runner and scheduler can hold it
/// without carrying the sampler type parameter around.
#[async_trait]
pub trait HeadroomGuard: Send + Sync {
    async fn wait_for_headroom(&self) -> Result<(), SyncError>;
}

#[async_trait]
impl<S: ResourceSampler + 'static> HeadroomGuard for ResourceGuard<S> {
    async fn wait_for_headroom(&self) -> Result<(), SyncError> {
        ResourceGuard::wait_for_headroom(self).await
    }
}

/// Pre-attempt check that defers work under high CPU/memory load and
/// aborts the attempt chain if the pressure never clears.
pub struct ResourceGuard<S: ResourceSampler> {
    sampler: tokio::sync::Mutex<S>,
    cpu_threshold_pct: f32,
    mem_threshold_pct: f32,
    check_interval: Duration,
    max_checks: u32,
}

impl Default for ResourceGuard<SysinfoSampler> {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default(), SysinfoSampler::new())
    }
}

impl<S: ResourceSampler> ResourceGuard<S> {
    pub fn from_config(config: &EngineConfig, sampler: S) -> Self {
        Self {
            sampler: tokio::sync::Mutex::new(sampler),
            cpu_threshold_pct: config.cpu_threshold_pct,
            mem_threshold_pct: config.mem_threshold_pct,
            check_interval: config.resource_check_interval,
            max_checks: config.resource_max_checks,
        }
    }

    /// Sample until both CPU and memory are under threshold, waiting
    /// `check_interval` between samples, up to `max_checks` samples.
    /// Still over after the last check: `ResourceExhaustion`, and the
    /// caller must not invoke the adapter.
    pub async fn wait_for_headroom(&self) -> Result<(), SyncError> {
        let mut last = ResourceSample {
            cpu_pct: 0.0,
            mem_pct: 0.0,
        };

        for check in 0..self.max_checks {
            last = self.sampler.lock().await.sample();
            if last.cpu_pct < self.cpu_threshold_pct && last.mem_pct < self.mem_threshold_pct {
                return Ok(());
            }
            warn!(
                cpu_pct = last.cpu_pct,
                mem_pct = last.mem_pct,
                check = check + 1,
                max_checks = self.max_checks,
                "High resource usage, deferring attempt"
            );
            if check + 1 < self.max_checks {
                tokio::time::sleep(self.check_interval).await;
            }
        }

        Err(SyncError::ResourceExhaustion(format!(
            "cpu {:.0}% / mem {:.0}% still over threshold after {} checks",
            last.cpu_pct, last.mem_pct, self.max_checks
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedSampler {
        samples: Vec<ResourceSample>,
        cursor: usize,
    }

    impl ScriptedSampler {
        fn new(samples: Vec<(f32, f32)>) -> Self {
            Self {
                samples: samples
                    .into_iter()
                    .map(|(cpu_pct, mem_pct)| ResourceSample { cpu_pct, mem_pct })
                    .collect(),
                cursor: 0,
            }
        }
    }

    impl ResourceSampler for ScriptedSampler {
        fn sample(&mut self) -> ResourceSample {
            let sample = self.samples[self.cursor.min(self.samples.len() - 1)];
            self.cursor += 1;
            sample
        }
    }

    fn guard_with(samples: Vec<(f32, f32)>) -> ResourceGuard<ScriptedSampler> {
        ResourceGuard::from_config(&EngineConfig::default(), ScriptedSampler::new(samples))
    }

    #[tokio::test(start_paused = true)]
    async fn passes_immediately_with_headroom() {
        let guard = guard_with(vec![(20.0, 40.0)]);
        assert!(guard.wait_for_headroom().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_pressure_clears() {
        let guard = guard_with(vec![(95.0, 50.0), (90.0, 50.0), (30.0, 50.0)]);
        assert!(guard.wait_for_headroom().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_pressure_aborts_with_resource_exhaustion() {
        let guard = guard_with(vec![(95.0, 90.0)]);
        let err = guard.wait_for_headroom().await.unwrap_err();
        assert!(matches!(err, SyncError::ResourceExhaustion(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_alone_can_trip_the_guard() {
        let guard = guard_with(vec![(10.0, 99.0)]);
        let err = guard.wait_for_headroom().await.unwrap_err();
        assert!(matches!(err, SyncError::ResourceExhaustion(_)));
    }
}
