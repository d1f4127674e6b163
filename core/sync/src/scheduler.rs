//! Periodic sync scheduling.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::WeakSyncEngine;
use crate::transport::SyncTransport;

/// Background task that runs a sync pass every `period`.
///
/// The task only holds a weak handle, so it never keeps the engine alive and
/// exits on its own once the engine is dropped. Stopping or dropping the
/// timer only interrupts the wait between ticks; a pass already running is
/// allowed to finish and release the sync lock.
pub struct AutoSyncTimer {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    period: Duration,
}

impl AutoSyncTimer {
    /// Spawn the timer. The first pass runs one full period after spawning.
    pub fn spawn<T>(engine: WeakSyncEngine<T>, period: Duration) -> Self
    where
        T: SyncTransport + ?Sized + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Auto-sync timer started, every {:?}", period);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        debug!("Auto-sync timer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let Some(engine) = engine.upgrade() else {
                    debug!("Engine dropped, auto-sync timer exiting");
                    break;
                };
                if !engine.is_online().await {
                    debug!("Skipping periodic sync while offline");
                    continue;
                }

                debug!("Triggering periodic sync");
                let result = engine.sync().await;
                if let Some(reason) = &result.skipped {
                    debug!("Periodic sync skipped: {}", reason);
                } else if result.success {
                    info!(
                        "Periodic sync completed: {} completed, {} pulled",
                        result.operations_completed, result.changes_pulled
                    );
                } else {
                    warn!(
                        "Periodic sync finished with {} errors",
                        result.errors.len()
                    );
                }
            }
        });

        Self {
            task,
            shutdown,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ask the task to exit at its next wait.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for AutoSyncTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
