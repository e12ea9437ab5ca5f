//! Safe replacement of the running scheduler on configuration change.
//!
//! Restart protocol:
//! 1. Cancel the running loop and mark the phase `StopRequested`.
//! 2. Wait the grace period, read fresh from the configuration.
//! 3. If a newer request arrived meanwhile, give up; it owns the restart.
//! 4. Wait for the old loop to leave (its in-flight cycle completes first).
//! 5. Bump the generation and start the replacement.
//!
//! Steps 3-5 run under one lock, so at most one loop is ever active.

use crate::error::Result;
use crate::pool::WorkerPool;
use crate::scheduler::{RunState, ScanContext, Scheduler, SLEEP_TICK};
use crate::store::StatusStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of [`ReconfigurationController::request_restart`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// A new loop was started with this generation
    Restarted { generation: u64 },
    /// A later request took over this one
    Superseded,
}

struct LoopHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

pub struct ReconfigurationController {
    context: ScanContext,
    state: Arc<RunState>,
    current: Mutex<Option<LoopHandle>>,
    restart_seq: AtomicU64,
    transition: tokio::sync::Mutex<()>,
}

impl ReconfigurationController {
    pub fn new(context: ScanContext) -> Self {
        Self {
            context,
            state: Arc::new(RunState::new()),
            current: Mutex::new(None),
            restart_seq: AtomicU64::new(0),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.context.store
    }

    /// Whether a loop task exists and has not finished
    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Start the first loop. A no-op if one is already running.
    ///
    /// Fails only when worker capacity cannot be allocated.
    pub async fn start(&self) -> Result<u64> {
        let _transition = self.transition.lock().await;
        if let Some(generation) = self.running_generation() {
            tracing::debug!("Scheduler generation {} already running", generation);
            return Ok(generation);
        }
        self.spawn_loop()
    }

    /// Replace the running loop with one reading fresh configuration.
    ///
    /// Overlapping calls coalesce: only the most recent one starts a loop.
    pub async fn request_restart(&self) -> Result<RestartOutcome> {
        let ticket = self.restart_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let grace = self.context.provider.current().restart_grace();
        tracing::info!(
            "Restart #{} requested, waiting {:?} for generation {} to stop",
            ticket,
            grace,
            self.state.generation()
        );

        self.signal_stop();
        tokio::time::sleep(grace).await;
        if self.superseded(ticket) {
            return Ok(RestartOutcome::Superseded);
        }

        let _transition = self.transition.lock().await;
        if self.superseded(ticket) {
            return Ok(RestartOutcome::Superseded);
        }

        let previous = self.take_current();
        if let Some(previous) = previous {
            let waited = Instant::now();
            Self::wait_for_exit(previous).await;
            if waited.elapsed() > SLEEP_TICK {
                tracing::info!(
                    "Previous loop needed {:.1}s past the grace period to finish its cycle",
                    waited.elapsed().as_secs_f64()
                );
            }
        }
        if self.superseded(ticket) {
            return Ok(RestartOutcome::Superseded);
        }

        let generation = self.spawn_loop()?;
        Ok(RestartOutcome::Restarted { generation })
    }

    /// Stop the running loop and wait for it to leave.
    ///
    /// Pending restart requests are abandoned.
    pub async fn shutdown(&self) {
        self.restart_seq.fetch_add(1, Ordering::SeqCst);
        self.signal_stop();
        let _transition = self.transition.lock().await;
        if let Some(previous) = self.take_current() {
            Self::wait_for_exit(previous).await;
        }
    }

    fn superseded(&self, ticket: u64) -> bool {
        let latest = self.restart_seq.load(Ordering::SeqCst);
        if latest != ticket {
            tracing::debug!("Restart #{} superseded by #{}", ticket, latest);
            return true;
        }
        false
    }

    fn running_generation(&self) -> Option<u64> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|handle| !handle.task.is_finished())
            .map(|handle| handle.generation)
    }

    fn take_current(&self) -> Option<LoopHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn signal_stop(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = current.as_ref() {
            handle.cancel.cancel();
            self.state.request_stop();
        }
    }

    async fn wait_for_exit(handle: LoopHandle) {
        handle.cancel.cancel();
        match handle.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(
                "Scheduler generation {} ended with error: {}",
                handle.generation,
                e
            ),
            Err(e) => tracing::error!(
                "Scheduler generation {} panicked: {}",
                handle.generation,
                e
            ),
        }
    }

    /// Caller must hold `transition`
    fn spawn_loop(&self) -> Result<u64> {
        let config = self.context.provider.current();
        WorkerPool::check_capacity(config.max_concurrent_scans())?;

        let generation = self.state.advance_generation();
        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(
            generation,
            self.context.clone(),
            Arc::clone(&self.state),
            cancel.clone(),
        );
        let task = tokio::spawn(scheduler.run());

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(LoopHandle {
            generation,
            cancel,
            task,
        });
        tracing::info!(
            "Started scheduler generation {} over {} segments",
            generation,
            config.active_targets().len()
        );
        Ok(generation)
    }
}
