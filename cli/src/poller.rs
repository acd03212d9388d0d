use crate::manager::{ReconcileOutcome, TaskManager};
use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};
use tokio::{
    task::{AbortHandle, JoinHandle},
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

struct Running {
    abort: AbortHandle,
    // Taken by `join`; the abort handle stays behind for `stop`.
    handle: Option<JoinHandle<()>>,
}

/// Single owner of the reconciliation timer. Runs while anything is
/// pending and winds itself down afterwards.
pub struct Poller {
    manager: Arc<TaskManager>,
    period: Duration,
    running: StdMutex<Option<Running>>,
}

impl Poller {
    pub fn new(manager: Arc<TaskManager>, period: Duration) -> Self {
        Self { manager, period, running: StdMutex::new(None) }
    }

    /// Starts the loop unless it is already running or there is nothing to
    /// watch. Returns whether a loop is running afterwards.
    pub async fn ensure_running(&self) -> bool {
        if !self.manager.has_pending().await {
            return self.is_running();
        }
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|running| !running.abort.is_finished()) {
            return true;
        }
        let manager = self.manager.clone();
        let period = self.period;
        let handle = tokio::spawn(async move { poll_until_idle(manager, period).await });
        *slot = Some(Running { abort: handle.abort_handle(), handle: Some(handle) });
        info!(period_secs = period.as_secs(), "poller started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|running| !running.abort.is_finished())
    }

    /// Waits for the loop to wind down on its own.
    pub async fn join(&self) {
        let handle = self.slot().as_mut().and_then(|running| running.handle.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    error!("poller task ended abnormally: {err}");
                }
            }
        }
    }

    /// Abandons the loop, including any status checks in flight.
    pub fn stop(&self) {
        if let Some(running) = self.slot().take() {
            running.abort.abort();
            debug!("poller stopped");
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_until_idle(manager: Arc<TaskManager>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match manager.reconcile().await {
            ReconcileOutcome::Idle => break,
            ReconcileOutcome::Skipped => debug!("previous pass still running"),
            ReconcileOutcome::Checked { checked, changed } => {
                debug!(checked, changed, "reconcile pass finished");
            }
        }
        if !manager.has_pending().await {
            break;
        }
    }
    info!("nothing pending, poller idle");
}
