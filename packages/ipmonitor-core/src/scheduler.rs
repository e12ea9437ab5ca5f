//! Background scan scheduler.
//!
//! One [`Scheduler`] drives repeated cycles: read the configuration, sweep
//! every active segment through a [`WorkerPool`], publish each snapshot as
//! its job finishes, then sleep for the shortest active interval in one-second
//! ticks. A cycle that has started always runs to completion; a stop request
//! only prevents the next one.

use crate::config::{ConfigProvider, ScanConfig, SegmentId};
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::scanner::Probe;
use crate::store::StatusStore;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sleep used when no segment is active
pub const FALLBACK_SLEEP: Duration = Duration::from_secs(10);

/// Granularity at which a sleeping loop notices a stop request
pub const SLEEP_TICK: Duration = Duration::from_secs(1);

/// Time to wait before the next cycle: the smallest interval among active
/// segments, or [`FALLBACK_SLEEP`] when none are active.
pub fn next_sleep(config: &ScanConfig) -> Duration {
    config
        .active_segments()
        .map(|segment| config.interval_for(segment))
        .min()
        .unwrap_or(FALLBACK_SLEEP)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Running,
    StopRequested,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::StopRequested => write!(f, "stop requested"),
            Phase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Lifecycle state shared by the controller and every loop it starts.
#[derive(Debug)]
pub struct RunState {
    phase: Mutex<Phase>,
    generation: AtomicU64,
    active_loops: AtomicUsize,
    peak_active_loops: AtomicUsize,
    cycles_completed: AtomicU64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            phase: Mutex::new(Phase::Stopped),
            generation: AtomicU64::new(0),
            active_loops: AtomicUsize::new(0),
            peak_active_loops: AtomicUsize::new(0),
            cycles_completed: AtomicU64::new(0),
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation of the most recently started loop
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Loops currently inside [`Scheduler::run`]
    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    /// Highest number of loops ever running at the same time
    pub fn peak_active_loops(&self) -> usize {
        self.peak_active_loops.load(Ordering::SeqCst)
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn request_stop(&self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::Running {
            *phase = Phase::StopRequested;
        }
    }

    /// Phase changes from a superseded loop are ignored
    fn set_phase_for(&self, generation: u64, next: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if self.generation() == generation {
            *phase = next;
        }
    }

    fn enter_loop(&self) -> ActiveLoopGuard<'_> {
        let now = self.active_loops.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_loops.fetch_max(now, Ordering::SeqCst);
        ActiveLoopGuard { state: self }
    }
}

struct ActiveLoopGuard<'a> {
    state: &'a RunState,
}

impl Drop for ActiveLoopGuard<'_> {
    fn drop(&mut self) {
        self.state.active_loops.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collaborators a scheduler needs, shared across generations.
#[derive(Clone)]
pub struct ScanContext {
    pub provider: Arc<dyn ConfigProvider>,
    pub store: Arc<StatusStore>,
    pub probe: Arc<dyn Probe>,
}

impl ScanContext {
    pub fn new(
        provider: Arc<dyn ConfigProvider>,
        store: Arc<StatusStore>,
        probe: Arc<dyn Probe>,
    ) -> Self {
        Self {
            provider,
            store,
            probe,
        }
    }
}

/// Summary of one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub generation: u64,
    /// Segments whose snapshot was replaced, in completion order
    pub scanned: Vec<SegmentId>,
    /// Segments whose probe failed; their previous status is kept
    pub failed: Vec<SegmentId>,
    pub elapsed: Duration,
    pub next_sleep: Duration,
}

pub struct Scheduler {
    generation: u64,
    context: ScanContext,
    state: Arc<RunState>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        generation: u64,
        context: ScanContext,
        state: Arc<RunState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            generation,
            context,
            state,
            cancel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled, or replaced by a newer generation
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.state.generation() != self.generation
    }

    /// Run cycles until stopped.
    ///
    /// Only a worker pool that cannot be allocated ends the loop with an error.
    pub async fn run(self) -> Result<()> {
        let _active = self.state.enter_loop();
        self.state.set_phase_for(self.generation, Phase::Running);
        tracing::info!("Scheduler generation {} started", self.generation);

        let result = self.drive().await;

        self.state.set_phase_for(self.generation, Phase::Stopped);
        match &result {
            Ok(()) => tracing::info!("Scheduler generation {} stopped", self.generation),
            Err(e) => tracing::error!("Scheduler generation {} failed: {}", self.generation, e),
        }
        result
    }

    async fn drive(&self) -> Result<()> {
        loop {
            if self.should_stop() {
                return Ok(());
            }

            let report = self.run_cycle().await?;
            tracing::info!(
                "Cycle complete in {:.1}s: {} scanned, {} failed, next in {}s",
                report.elapsed.as_secs_f64(),
                report.scanned.len(),
                report.failed.len(),
                report.next_sleep.as_secs()
            );

            if self.sleep_or_stop(report.next_sleep).await {
                return Ok(());
            }
        }
    }

    /// Sweep every active segment once and publish the results.
    ///
    /// Returns after every dispatched job has finished.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let config = self.context.provider.current();
        let started = Instant::now();
        let mut report = CycleReport {
            generation: self.generation,
            scanned: Vec::new(),
            failed: Vec::new(),
            elapsed: Duration::ZERO,
            next_sleep: next_sleep(&config),
        };

        if config.active_targets().is_empty() {
            tracing::debug!(
                "No active segments, idling for {}s",
                report.next_sleep.as_secs()
            );
            self.state.cycles_completed.fetch_add(1, Ordering::SeqCst);
            return Ok(report);
        }

        let mut pool = WorkerPool::new(
            config.max_concurrent_scans(),
            Arc::clone(&self.context.probe),
            config.probe_settings(),
        )?;
        for target in config.active_targets() {
            pool.submit(*target);
        }
        tracing::debug!(
            "Generation {} dispatched {} segments ({} at a time)",
            self.generation,
            pool.pending(),
            pool.capacity()
        );

        while let Some(outcome) = pool.next_completed().await {
            match outcome.result {
                Ok(snapshot) => {
                    tracing::info!(
                        "Segment {}: {} devices, {} online ({:.1}s)",
                        outcome.segment,
                        snapshot.devices.len(),
                        snapshot.online_count(),
                        outcome.elapsed.as_secs_f64()
                    );
                    self.context.store.set(outcome.segment, snapshot);
                    report.scanned.push(outcome.segment);
                }
                Err(e) => {
                    tracing::warn!("{}; keeping previous status", e);
                    report.failed.push(outcome.segment);
                }
            }
        }

        report.elapsed = started.elapsed();
        self.state.cycles_completed.fetch_add(1, Ordering::SeqCst);
        Ok(report)
    }

    /// Sleep in ticks. Returns true if a stop was observed.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        let ticks = duration.as_secs().max(1);
        for _ in 0..ticks {
            if self.should_stop() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = tokio::time::sleep(SLEEP_TICK) => {}
            }
        }
        self.should_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, SegmentTarget, SharedConfig};
    use crate::scanner::{DeviceRecord, DeviceStatus, ProbeSettings};
    use async_trait::async_trait;

    struct InstantProbe;

    #[async_trait]
    impl Probe for InstantProbe {
        async fn probe(
            &self,
            target: &SegmentTarget,
            _settings: &ProbeSettings,
        ) -> anyhow::Result<Vec<DeviceRecord>> {
            Ok(vec![DeviceRecord::new(target.range(), DeviceStatus::new("on"))])
        }
    }

    fn config(active: &[i64], intervals: &[(&str, i64)]) -> ScanConfig {
        let mut file = ConfigFile::default();
        file.segments.active = active.to_vec();
        file.segments.intervals = intervals
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        ScanConfig::from_file(&file).unwrap()
    }

    fn scheduler(config: ScanConfig) -> (Scheduler, Arc<StatusStore>, Arc<RunState>, CancellationToken) {
        let store = Arc::new(StatusStore::new());
        let state = Arc::new(RunState::new());
        let cancel = CancellationToken::new();
        let context = ScanContext::new(
            Arc::new(SharedConfig::new(config)),
            Arc::clone(&store),
            Arc::new(InstantProbe),
        );
        let generation = state.advance_generation();
        (
            Scheduler::new(generation, context, Arc::clone(&state), cancel.clone()),
            store,
            state,
            cancel,
        )
    }

    #[test]
    fn test_next_sleep_is_min_active_interval() {
        let c = config(&[70, 80], &[("70", 10), ("80", 20), ("85", 5)]);
        assert_eq!(next_sleep(&c), Duration::from_secs(10));
    }

    #[test]
    fn test_next_sleep_uses_default_for_missing_interval() {
        let c = config(&[70, 80], &[("70", 120)]);
        assert_eq!(next_sleep(&c), Duration::from_secs(60));
    }

    #[test]
    fn test_next_sleep_fallback_when_idle() {
        let c = config(&[], &[("70", 5)]);
        assert_eq!(next_sleep(&c), FALLBACK_SLEEP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_scans_every_active_segment() {
        let (scheduler, store, state, _cancel) =
            scheduler(config(&[70, 80], &[("70", 10), ("80", 20)]));
        let report = scheduler.run_cycle().await.unwrap();

        let mut scanned = report.scanned.clone();
        scanned.sort();
        assert_eq!(scanned, vec![70, 80]);
        assert!(report.failed.is_empty());
        assert_eq!(report.next_sleep, Duration::from_secs(10));
        assert!(store.get(70).is_scanned());
        assert!(store.get(80).is_scanned());
        assert_eq!(state.cycles_completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_active_set_idles() {
        let (scheduler, store, _state, _cancel) = scheduler(config(&[], &[]));
        let report = scheduler.run_cycle().await.unwrap();
        assert!(report.scanned.is_empty());
        assert_eq!(report.next_sleep, FALLBACK_SLEEP);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_sleep_is_observed_within_a_tick() {
        let (scheduler, _store, state, cancel) = scheduler(config(&[70], &[("70", 300)]));
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(state.phase(), Phase::Running);
        assert_eq!(state.cycles_completed(), 1);

        let stop_at = Instant::now();
        state.request_stop();
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(stop_at.elapsed() <= SLEEP_TICK);
        assert_eq!(state.phase(), Phase::Stopped);
        assert_eq!(state.active_loops(), 0);
        assert_eq!(state.cycles_completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_generation_exits() {
        let (scheduler, _store, state, _cancel) = scheduler(config(&[70], &[("70", 60)]));
        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(500)).await;

        state.advance_generation();
        let exited_at = Instant::now();
        handle.await.unwrap().unwrap();
        assert!(exited_at.elapsed() <= SLEEP_TICK);
        assert_eq!(state.active_loops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_repeats_after_sleep() {
        let (scheduler, _store, state, cancel) = scheduler(config(&[70], &[("70", 5)]));
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(11_500)).await;
        assert_eq!(state.cycles_completed(), 3);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
