//! Bounded-concurrency execution of probe jobs for one cycle.
//!
//! A pool is built fresh for every cycle from that cycle's configuration, so
//! a changed concurrency bound only ever applies from the next cycle on.

use crate::config::{SegmentId, SegmentTarget};
use crate::error::{MonitorError, Result};
use crate::scanner::{Probe, ProbeSettings, Snapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Completed probe job
#[derive(Debug)]
pub struct JobOutcome {
    pub segment: SegmentId,
    pub started_at: Instant,
    pub elapsed: Duration,
    pub result: Result<Snapshot>,
}

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
    probe: Arc<dyn Probe>,
    settings: ProbeSettings,
    jobs: JoinSet<JobOutcome>,
}

impl WorkerPool {
    pub fn new(capacity: usize, probe: Arc<dyn Probe>, settings: ProbeSettings) -> Result<Self> {
        Self::check_capacity(capacity)?;
        Ok(Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            probe,
            settings,
            jobs: JoinSet::new(),
        })
    }

    /// Whether a pool of this size can be allocated at all
    pub fn check_capacity(capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(MonitorError::ResourceExhaustion(
                "worker pool needs at least one slot".to_string(),
            ));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(MonitorError::ResourceExhaustion(format!(
                "worker pool of {} slots exceeds the semaphore limit",
                capacity
            )));
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs submitted and not yet collected
    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Queue a sweep of one segment. It starts once a slot is free.
    pub fn submit(&mut self, target: SegmentTarget) {
        let permits = Arc::clone(&self.permits);
        let probe = Arc::clone(&self.probe);
        let settings = self.settings;

        self.jobs.spawn(async move {
            let segment = target.id;
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return JobOutcome {
                        segment,
                        started_at: Instant::now(),
                        elapsed: Duration::ZERO,
                        result: Err(MonitorError::ResourceExhaustion(
                            "worker pool closed".to_string(),
                        )),
                    };
                }
            };

            let started_at = Instant::now();
            tracing::debug!("Probing segment {} ({})", segment, target.range());

            // Run the probe on its own task so a panic stays a per-segment failure
            let sweep = tokio::spawn(async move { probe.probe(&target, &settings).await });
            let result = match sweep.await {
                Ok(Ok(devices)) => Ok(Snapshot::new(segment, devices)),
                Ok(Err(e)) => Err(MonitorError::ProbeFailure {
                    segment,
                    message: format!("{:#}", e),
                }),
                Err(e) => Err(MonitorError::ProbeFailure {
                    segment,
                    message: format!("probe task failed: {}", e),
                }),
            };

            JobOutcome {
                segment,
                started_at,
                elapsed: started_at.elapsed(),
                result,
            }
        });
    }

    /// Next job to finish, in completion order. `None` once all are collected.
    pub async fn next_completed(&mut self) -> Option<JobOutcome> {
        while let Some(joined) = self.jobs.join_next().await {
            match joined {
                Ok(outcome) => return Some(outcome),
                Err(e) => tracing::error!("Worker task failed: {}", e),
            }
        }
        None
    }
}
