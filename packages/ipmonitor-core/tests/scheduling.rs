use async_trait::async_trait;
use ipmonitor_core::config::ConfigFile;
use ipmonitor_core::{
    DeviceRecord, DeviceStatus, Probe, ProbeSettings, ReconfigurationController, RestartOutcome,
    RunState, ScanConfig, ScanContext, Scheduler, SegmentId, SegmentStatus, SegmentTarget,
    SharedConfig, StatusStore,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct Call {
    segment: SegmentId,
    started: Instant,
    finished: Instant,
}

/// Probe with a fixed delay, a switchable set of failing segments and a call log
struct ScriptedProbe {
    delay: Duration,
    failing: Mutex<HashSet<SegmentId>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedProbe {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn fail(&self, segment: SegmentId, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(segment);
        } else {
            set.remove(&segment);
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn probe(
        &self,
        target: &SegmentTarget,
        _settings: &ProbeSettings,
    ) -> anyhow::Result<Vec<DeviceRecord>> {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.calls.lock().unwrap().push(Call {
            segment: target.id,
            started,
            finished: Instant::now(),
        });

        if self.failing.lock().unwrap().contains(&target.id) {
            anyhow::bail!("ping sweep of {} timed out", target.range());
        }
        Ok(target
            .network
            .iter()
            .skip(1)
            .take(3)
            .map(|ip| DeviceRecord::new(ip.to_string(), DeviceStatus::new("on")))
            .collect())
    }
}

fn scan_config(active: &[i64], intervals: &[(&str, i64)], concurrency: i64) -> ScanConfig {
    let mut file = ConfigFile::default();
    file.segments.active = active.to_vec();
    file.segments.intervals = intervals
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
    file.network.max_concurrent_scans = concurrency;
    ScanConfig::from_file(&file).unwrap()
}

fn one_shot_scheduler(config: ScanConfig, probe: Arc<dyn Probe>) -> (Scheduler, Arc<StatusStore>) {
    let store = Arc::new(StatusStore::new());
    let state = Arc::new(RunState::new());
    let context = ScanContext::new(Arc::new(SharedConfig::new(config)), Arc::clone(&store), probe);
    let generation = state.generation();
    (
        Scheduler::new(generation, context, state, CancellationToken::new()),
        store,
    )
}

#[tokio::test(start_paused = true)]
async fn test_one_cycle_scans_both_segments_and_sleeps_for_shortest_interval() {
    let probe = ScriptedProbe::new(Duration::from_millis(300));
    let (scheduler, store) = one_shot_scheduler(
        scan_config(&[70, 80], &[("70", 10), ("80", 20)], 3),
        probe,
    );

    let report = scheduler.run_cycle().await.unwrap();

    assert_eq!(report.next_sleep, Duration::from_secs(10));
    for segment in [70, 80] {
        let status = store.get(segment);
        assert!(status.is_scanned(), "segment {} still unscanned", segment);
        assert_eq!(status.snapshot().unwrap().online_count(), 3);
    }
    assert_eq!(store.get(85), SegmentStatus::Unscanned);
}

#[tokio::test(start_paused = true)]
async fn test_single_slot_pool_runs_jobs_strictly_in_sequence() {
    let probe = ScriptedProbe::new(Duration::from_secs(2));
    let (scheduler, _store) = one_shot_scheduler(scan_config(&[70, 80, 86], &[], 1), probe.clone());

    scheduler.run_cycle().await.unwrap();

    let mut calls = probe.calls();
    calls.sort_by_key(|call| call.started);
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert!(
            pair[1].started >= pair[0].finished,
            "segment {} started before segment {} finished",
            pair[1].segment,
            pair[0].segment
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_segment_keeps_previous_status() {
    let probe = ScriptedProbe::new(Duration::from_millis(100));
    probe.fail(85, true);
    let (scheduler, store) = one_shot_scheduler(scan_config(&[70, 80, 85], &[], 3), probe.clone());

    // First cycle: 85 never scanned
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.failed, vec![85]);
    assert_eq!(store.get(85), SegmentStatus::Unscanned);
    assert!(store.get(70).is_scanned());
    assert!(store.get(80).is_scanned());

    // Second cycle succeeds for 85
    probe.fail(85, false);
    scheduler.run_cycle().await.unwrap();
    let good = store.get(85).snapshot().cloned().unwrap();
    let seventy_before = store.get(70).snapshot().cloned().unwrap();

    // Third cycle fails again: the earlier snapshot is still served
    probe.fail(85, true);
    let report = scheduler.run_cycle().await.unwrap();
    assert_eq!(report.failed, vec![85]);
    assert!(Arc::ptr_eq(store.get(85).snapshot().unwrap(), &good));

    let seventy_after = store.get(70).snapshot().cloned().unwrap();
    assert!(!Arc::ptr_eq(&seventy_after, &seventy_before));
}

/// Alternates between a short and a long device list on every call
struct AlternatingProbe {
    calls: AtomicUsize,
}

#[async_trait]
impl Probe for AlternatingProbe {
    async fn probe(
        &self,
        target: &SegmentTarget,
        _settings: &ProbeSettings,
    ) -> anyhow::Result<Vec<DeviceRecord>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let hosts = if n % 2 == 0 { 254 } else { 10 };
        Ok(target
            .network
            .iter()
            .skip(1)
            .take(hosts)
            .map(|ip| DeviceRecord::new(ip.to_string(), DeviceStatus::online()))
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_never_observe_partial_snapshot() {
    let probe = Arc::new(AlternatingProbe {
        calls: AtomicUsize::new(0),
    });
    let (scheduler, store) = one_shot_scheduler(scan_config(&[70], &[], 1), probe);
    scheduler.run_cycle().await.unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut reads = 0usize;
                while !done.load(Ordering::Relaxed) {
                    let snapshot = store.get(70).snapshot().cloned().unwrap();
                    let len = snapshot.devices.len();
                    assert!(len == 10 || len == 254, "observed {} devices", len);
                    assert_eq!(snapshot.online_count(), len);
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for _ in 0..40 {
        scheduler.run_cycle().await.unwrap();
    }
    done.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
}

fn controller_with(
    config: ScanConfig,
    probe: Arc<dyn Probe>,
) -> (Arc<ReconfigurationController>, Arc<SharedConfig>) {
    let provider = Arc::new(SharedConfig::new(config));
    let controller = Arc::new(ReconfigurationController::new(ScanContext::new(
        provider.clone(),
        Arc::new(StatusStore::new()),
        probe,
    )));
    (controller, provider)
}

/// Samples the active-loop counter until told to stop, returning the maximum seen
fn watch_active_loops(
    controller: &Arc<ReconfigurationController>,
) -> (tokio::task::JoinHandle<usize>, CancellationToken) {
    let stop = CancellationToken::new();
    let controller = Arc::clone(controller);
    let token = stop.clone();
    let handle = tokio::spawn(async move {
        let mut max_seen = 0;
        while !token.is_cancelled() {
            max_seen = max_seen.max(controller.state().active_loops());
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        max_seen
    });
    (handle, stop)
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_restarts_produce_one_new_loop() {
    let probe = ScriptedProbe::new(Duration::from_millis(50));
    let (controller, _provider) = controller_with(scan_config(&[70, 80], &[], 3), probe);
    assert_eq!(controller.start().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (watcher, stop_watching) = watch_active_loops(&controller);

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.request_restart().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.request_restart().await })
    };

    assert_eq!(first.await.unwrap().unwrap(), RestartOutcome::Superseded);
    assert_eq!(
        second.await.unwrap().unwrap(),
        RestartOutcome::Restarted { generation: 2 }
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    stop_watching.cancel();
    assert!(watcher.await.unwrap() <= 1);

    assert_eq!(controller.state().generation(), 2);
    assert_eq!(controller.state().active_loops(), 1);
    assert_eq!(controller.state().peak_active_loops(), 1);
    controller.shutdown().await;
    assert_eq!(controller.state().active_loops(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_storm_never_overlaps_loops() {
    // Probes outlast the grace period so the old loop is mid-cycle at handover
    let probe = ScriptedProbe::new(Duration::from_secs(3));
    let (controller, _provider) = controller_with(scan_config(&[70, 80, 85, 86], &[], 2), probe);
    controller.start().await.unwrap();
    let (watcher, stop_watching) = watch_active_loops(&controller);

    let mut requests = Vec::new();
    for _ in 0..5 {
        let controller = Arc::clone(&controller);
        requests.push(tokio::spawn(async move { controller.request_restart().await }));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut restarted = Vec::new();
    for request in requests {
        if let RestartOutcome::Restarted { generation } = request.await.unwrap().unwrap() {
            restarted.push(generation);
        }
    }
    assert_eq!(restarted, vec![2]);

    tokio::time::sleep(Duration::from_secs(10)).await;
    stop_watching.cancel();
    assert!(watcher.await.unwrap() <= 1);
    assert_eq!(controller.state().peak_active_loops(), 1);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconfiguration_applies_from_next_generation() {
    let probe = ScriptedProbe::new(Duration::from_millis(100));
    let (controller, provider) =
        controller_with(scan_config(&[70], &[("70", 5)], 3), probe.clone());
    controller.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(controller.store().get(70).is_scanned());
    assert_eq!(controller.store().get(204), SegmentStatus::Unscanned);

    provider.replace(scan_config(&[204], &[("204", 5)], 3));
    let outcome = controller.request_restart().await.unwrap();
    assert_eq!(outcome, RestartOutcome::Restarted { generation: 2 });
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(controller.store().get(204).is_scanned());
    // Segments no longer active keep their last snapshot
    assert!(controller.store().get(70).is_scanned());

    let calls_for_70 = probe.calls().iter().filter(|c| c.segment == 70).count();
    tokio::time::sleep(Duration::from_secs(12)).await;
    let calls_after = probe.calls().iter().filter(|c| c.segment == 70).count();
    assert_eq!(calls_for_70, calls_after);

    controller.shutdown().await;
}
