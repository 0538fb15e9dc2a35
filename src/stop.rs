//! # Cancellation Controller
//!
//! Turns stop requests (signals, or direct calls in tests) into a shared
//! [`StopPhase`] that every part of a run can observe through a cloneable
//! [`StopToken`]:
//!
//! - the first request moves the run to `Stopping`: no new samples are
//!   requested, in-flight ones complete, results are still produced;
//! - a second request, or the grace period expiring before the run calls
//!   [`StopController::finish`], moves it to `Aborted`: the run is torn down
//!   and returns no results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPhase {
    Running,
    Stopping,
    Aborted,
}

/// Owner side of a run's stop state.
#[derive(Debug, Clone)]
pub struct StopController {
    phase: Arc<watch::Sender<StopPhase>>,
    finished: Arc<AtomicBool>,
    grace_period: Duration,
}

impl StopController {
    pub fn new(grace_period: Duration) -> Self {
        let (phase, _) = watch::channel(StopPhase::Running);
        Self {
            phase: Arc::new(phase),
            finished: Arc::new(AtomicBool::new(false)),
            grace_period,
        }
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            phase: self.phase.subscribe(),
        }
    }

    pub fn phase(&self) -> StopPhase {
        *self.phase.borrow()
    }

    /// Ask the run to stop. Escalates to an abort on the second call.
    pub fn request_stop(&self) {
        match self.phase() {
            StopPhase::Running => {
                info!(
                    "Stopping... press again or wait {:?} to abort",
                    self.grace_period
                );
                self.phase.send_replace(StopPhase::Stopping);
                self.start_grace_timer();
            }
            StopPhase::Stopping => self.abort(),
            StopPhase::Aborted => {}
        }
    }

    /// Mark the run as done: an expiring grace period no longer aborts it.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    fn abort(&self) {
        if self.phase() != StopPhase::Aborted {
            warn!("Aborting");
            self.phase.send_replace(StopPhase::Aborted);
        }
    }

    fn start_grace_timer(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(controller.grace_period).await;
            if !controller.finished.load(Ordering::SeqCst) {
                controller.abort();
            }
        });
    }
}

/// Observer side of a run's stop state.
#[derive(Debug, Clone)]
pub struct StopToken {
    phase: watch::Receiver<StopPhase>,
}

impl StopToken {
    pub fn phase(&self) -> StopPhase {
        *self.phase.borrow()
    }

    /// No new samples should be requested.
    pub fn is_stopped(&self) -> bool {
        self.phase() != StopPhase::Running
    }

    pub fn is_aborted(&self) -> bool {
        self.phase() == StopPhase::Aborted
    }

    /// Resolve once a stop is requested.
    pub async fn stopped(&self) {
        let mut phase = self.phase.clone();
        if phase.wait_for(|phase| *phase != StopPhase::Running).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolve once the run is aborted. Never resolves otherwise.
    pub async fn aborted(&self) {
        let mut phase = self.phase.clone();
        if phase.wait_for(|phase| *phase == StopPhase::Aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Forward termination signals to `controller` until the returned task is
/// aborted.
pub fn listen_for_signals(controller: StopController) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = forward_signals(&controller).await {
            warn!("Could not listen for stop signals: {}", e);
        }
    })
}

#[cfg(unix)]
async fn forward_signals(controller: &StopController) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
            _ = quit.recv() => {}
        }
        controller.request_stop();
    }
}

#[cfg(not(unix))]
async fn forward_signals(controller: &StopController) -> std::io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        controller.request_stop();
    }
}
