//! Host resource sampling and admission throttling.
//!
//! The governor reads process and system utilisation through `sysinfo`,
//! tracks peaks and warning counters, and pauses the dispatcher when the
//! process crosses its memory or CPU ceiling. Sampling failures degrade to
//! zero readings; the governor never fails a run.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Callback that drops cached or reusable resources on request.
pub type Reclaimer = Box<dyn Fn() + Send + Sync>;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Governor thresholds.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Process memory ceiling, percent of system memory.
    pub max_memory_percent: f64,
    /// Process CPU ceiling, percent of total CPU capacity.
    pub max_cpu_percent: f64,
    /// Interval of the background monitoring task.
    pub check_interval: Duration,
    /// Whether [`ResourceGovernor::start_monitoring`] spawns anything.
    pub monitoring_enabled: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_memory_percent: 80.0,
            max_cpu_percent: 70.0,
            check_interval: Duration::from_secs(5),
            monitoring_enabled: true,
        }
    }
}

impl GovernorConfig {
    pub fn with_max_memory_percent(mut self, percent: f64) -> Self {
        self.max_memory_percent = percent;
        self
    }

    pub fn with_max_cpu_percent(mut self, percent: f64) -> Self {
        self.max_cpu_percent = percent;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring_enabled = enabled;
        self
    }
}

/// One utilisation reading. Percentages are in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    pub process_memory_percent: f64,
    pub process_memory_mb: f64,
    pub process_cpu_percent: f64,
    pub system_memory_percent: f64,
    pub system_cpu_percent: f64,
}

/// Cumulative governor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GovernorStats {
    pub memory_warnings: u64,
    pub cpu_warnings: u64,
    pub throttling_events: u64,
    pub peak_memory_percent: f64,
    pub peak_cpu_percent: f64,
    pub current: ResourceSample,
}

/// Outcome of a reclamation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub before_mb: f64,
    pub after_mb: f64,
    pub diff_mb: f64,
    pub percent_reduction: f64,
    pub aggressive: bool,
    pub reclaimers_run: usize,
}

struct Sampler {
    system: System,
    pid: Option<Pid>,
}

/// Samples host utilisation and throttles admission of new work.
pub struct ResourceGovernor {
    config: GovernorConfig,
    sampler: Mutex<Sampler>,
    stats: Mutex<GovernorStats>,
    reclaimers: Mutex<Vec<Reclaimer>>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Process id unavailable; process sampling disabled");
                None
            }
        };

        Self {
            config,
            sampler: Mutex::new(Sampler {
                system: System::new(),
                pid,
            }),
            stats: Mutex::new(GovernorStats::default()),
            reclaimers: Mutex::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Take a fresh reading and fold it into the peak values.
    pub fn sample(&self) -> ResourceSample {
        let sample = {
            let mut sampler = lock(&self.sampler);
            read_sample(&mut sampler)
        };

        let mut stats = lock(&self.stats);
        stats.peak_memory_percent = stats.peak_memory_percent.max(sample.process_memory_percent);
        stats.peak_cpu_percent = stats.peak_cpu_percent.max(sample.process_cpu_percent);
        stats.current = sample;
        sample
    }

    /// Pause for `pause` if the process is above either ceiling.
    ///
    /// Returns whether a pause occurred. Each pause bumps the throttling
    /// counter and the matching warning counter(s).
    pub async fn throttle_if_needed(&self, pause: Duration) -> bool {
        let sample = self.sample();
        let memory_high = sample.process_memory_percent > self.config.max_memory_percent;
        let cpu_high = sample.process_cpu_percent > self.config.max_cpu_percent;

        if !memory_high && !cpu_high {
            return false;
        }

        {
            let mut stats = lock(&self.stats);
            stats.throttling_events += 1;
            if memory_high {
                stats.memory_warnings += 1;
            }
            if cpu_high {
                stats.cpu_warnings += 1;
            }
        }

        tracing::warn!(
            memory_percent = sample.process_memory_percent,
            cpu_percent = sample.process_cpu_percent,
            pause_ms = pause.as_millis() as u64,
            "Resource ceiling exceeded, throttling dispatch"
        );
        tokio::time::sleep(pause).await;
        true
    }

    pub fn stats(&self) -> GovernorStats {
        lock(&self.stats).clone()
    }

    /// Register a callback invoked by [`optimize_memory`](Self::optimize_memory).
    pub fn register_reclaimer(&self, reclaimer: Reclaimer) {
        lock(&self.reclaimers).push(reclaimer);
    }

    /// Run the registered reclaimers and report the memory delta.
    ///
    /// With no reclaimers registered this only samples and reports.
    ///
    /// Aggressive mode runs the reclaimers a second time after the first pass
    /// has released its references.
    pub fn optimize_memory(&self, aggressive: bool) -> MemoryReport {
        let before_mb = self.sample().process_memory_mb;

        let passes = if aggressive { 2 } else { 1 };
        let mut reclaimers_run = 0;
        {
            let reclaimers = lock(&self.reclaimers);
            for _ in 0..passes {
                for reclaim in reclaimers.iter() {
                    reclaim();
                    reclaimers_run += 1;
                }
            }
        }

        let after_mb = self.sample().process_memory_mb;
        let diff_mb = before_mb - after_mb;
        let percent_reduction = if before_mb > 0.0 {
            diff_mb / before_mb * 100.0
        } else {
            0.0
        };

        tracing::info!(
            before_mb,
            after_mb,
            aggressive,
            reclaimers_run,
            "Memory optimisation pass"
        );

        MemoryReport {
            before_mb,
            after_mb,
            diff_mb,
            percent_reduction,
            aggressive,
            reclaimers_run,
        }
    }

    /// Spawn the periodic monitoring task, if enabled and not already running.
    ///
    /// The task stops when `cancel` fires or [`stop_monitoring`](Self::stop_monitoring)
    /// is called.
    pub fn start_monitoring(self: &Arc<Self>, cancel: &CancellationToken) {
        if !self.config.monitoring_enabled {
            return;
        }

        let mut monitor = lock(&self.monitor);
        if monitor.is_some() {
            return;
        }

        let token = cancel.child_token();
        let governor = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(governor.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => governor.check(),
                }
            }
            tracing::debug!("Resource monitoring stopped");
        });

        *monitor = Some((token, handle));
        tracing::debug!(
            interval_secs = self.config.check_interval.as_secs_f64(),
            "Resource monitoring started"
        );
    }

    /// Signal the monitoring task to stop without waiting for it.
    pub fn halt_monitoring(&self) {
        if let Some((token, _handle)) = lock(&self.monitor).take() {
            token.cancel();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor).is_some()
    }

    /// Stop the monitoring task and wait for it to exit.
    pub async fn stop_monitoring(&self) {
        let running = lock(&self.monitor).take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Resource monitor task failed");
            }
        }
    }

    /// One monitoring tick: sample, count ceiling breaches, log.
    fn check(&self) {
        let sample = self.sample();
        let mut stats = lock(&self.stats);

        if sample.process_memory_percent > self.config.max_memory_percent {
            stats.memory_warnings += 1;
            tracing::warn!(
                memory_percent = sample.process_memory_percent,
                limit = self.config.max_memory_percent,
                "High memory usage"
            );
        }
        if sample.process_cpu_percent > self.config.max_cpu_percent {
            stats.cpu_warnings += 1;
            tracing::warn!(
                cpu_percent = sample.process_cpu_percent,
                limit = self.config.max_cpu_percent,
                "High CPU usage"
            );
        }

        tracing::debug!(
            process_memory_mb = sample.process_memory_mb,
            system_memory_percent = sample.system_memory_percent,
            system_cpu_percent = sample.system_cpu_percent,
            "Resource sample"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_sample(sampler: &mut Sampler) -> ResourceSample {
    let system = &mut sampler.system;
    system.refresh_memory();
    system.refresh_cpu_usage();

    let total_memory = system.total_memory() as f64;
    let system_memory_percent = if total_memory > 0.0 {
        system.used_memory() as f64 / total_memory * 100.0
    } else {
        0.0
    };
    let system_cpu_percent = f64::from(system.global_cpu_usage());
    let cpu_count = system.cpus().len().max(1) as f64;

    let (process_memory_bytes, process_cpu_raw) = match sampler.pid {
        Some(pid) => {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system
                .process(pid)
                .map(|p| (p.memory() as f64, f64::from(p.cpu_usage())))
                .unwrap_or_default()
        }
        None => (0.0, 0.0),
    };

    let process_memory_percent = if total_memory > 0.0 {
        process_memory_bytes / total_memory * 100.0
    } else {
        0.0
    };

    ResourceSample {
        process_memory_percent: clamp_percent(process_memory_percent),
        process_memory_mb: process_memory_bytes / BYTES_PER_MB,
        process_cpu_percent: clamp_percent(process_cpu_raw / cpu_count),
        system_memory_percent: clamp_percent(system_memory_percent),
        system_cpu_percent: clamp_percent(system_cpu_percent),
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn always_throttle() -> GovernorConfig {
        GovernorConfig::default()
            .with_max_memory_percent(-1.0)
            .with_max_cpu_percent(-1.0)
    }

    #[test]
    fn test_default_config() {
        let config = GovernorConfig::default();
        assert_eq!(config.max_memory_percent, 80.0);
        assert_eq!(config.max_cpu_percent, 70.0);
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert!(config.monitoring_enabled);
    }

    #[test]
    fn test_sample_is_bounded() {
        let governor = ResourceGovernor::new(GovernorConfig::default());
        let sample = governor.sample();
        for value in [
            sample.process_memory_percent,
            sample.process_cpu_percent,
            sample.system_memory_percent,
            sample.system_cpu_percent,
        ] {
            assert!((0.0..=100.0).contains(&value), "{value}");
        }
        assert_eq!(governor.stats().current, sample);
    }

    #[tokio::test]
    async fn test_throttle_when_over_ceiling() {
        let governor = ResourceGovernor::new(always_throttle());
        assert!(governor.throttle_if_needed(Duration::from_millis(1)).await);
        assert!(governor.throttle_if_needed(Duration::from_millis(1)).await);

        let stats = governor.stats();
        assert_eq!(stats.throttling_events, 2);
        assert_eq!(stats.memory_warnings, 2);
        assert_eq!(stats.cpu_warnings, 2);
    }

    #[tokio::test]
    async fn test_no_throttle_under_ceiling() {
        let config = GovernorConfig::default()
            .with_max_memory_percent(100.0)
            .with_max_cpu_percent(100.0);
        let governor = ResourceGovernor::new(config);
        assert!(!governor.throttle_if_needed(Duration::from_secs(10)).await);
        assert_eq!(governor.stats().throttling_events, 0);
    }

    #[test]
    fn test_optimize_memory_runs_reclaimers() {
        let governor = ResourceGovernor::new(GovernorConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        governor.register_reclaimer(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let report = governor.optimize_memory(false);
        assert_eq!(report.reclaimers_run, 1);
        assert!(!report.aggressive);

        let report = governor.optimize_memory(true);
        assert_eq!(report.reclaimers_run, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_monitoring_counts_warnings_and_stops() {
        let config = always_throttle().with_check_interval(Duration::from_millis(5));
        let governor = Arc::new(ResourceGovernor::new(config));
        let cancel = CancellationToken::new();

        governor.start_monitoring(&cancel);
        tokio::time::sleep(Duration::from_millis(50)).await;
        governor.stop_monitoring().await;

        let stats = governor.stats();
        assert!(stats.memory_warnings >= 1);
        assert_eq!(stats.throttling_events, 0);
    }

    #[tokio::test]
    async fn test_monitoring_disabled_spawns_nothing() {
        let governor = Arc::new(ResourceGovernor::new(
            always_throttle()
                .with_monitoring(false)
                .with_check_interval(Duration::from_millis(1)),
        ));
        governor.start_monitoring(&CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        governor.stop_monitoring().await;
        assert_eq!(governor.stats().memory_warnings, 0);
    }

    #[tokio::test]
    async fn test_halt_monitoring_frees_slot() {
        let governor = Arc::new(ResourceGovernor::new(
            GovernorConfig::default().with_check_interval(Duration::from_millis(5)),
        ));
        let cancel = CancellationToken::new();

        governor.start_monitoring(&cancel);
        assert!(governor.is_monitoring());
        governor.halt_monitoring();
        assert!(!governor.is_monitoring());
        assert!(!cancel.is_cancelled());

        governor.start_monitoring(&cancel);
        assert!(governor.is_monitoring());
        governor.stop_monitoring().await;
    }
}
