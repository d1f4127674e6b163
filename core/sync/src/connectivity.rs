//! Network reachability tracking.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{SyncEngine, WeakSyncEngine};
use crate::transport::SyncTransport;

/// Source of reachability transitions.
pub trait Reachability: Send + Sync {
    /// Receiver holding the current reachability; it changes on every transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Reachability driven by explicit calls, for platforms that push network
/// callbacks and for tests.
pub struct ManualReachability {
    sender: watch::Sender<bool>,
}

impl ManualReachability {
    pub fn new(reachable: bool) -> Self {
        let (sender, _) = watch::channel(reachable);
        Self { sender }
    }

    /// Report the current reachability. Repeated values are not transitions.
    pub fn set_reachable(&self, reachable: bool) {
        self.sender.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        });
    }

    pub fn is_reachable(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Reachability for ManualReachability {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Forwards reachability transitions to an engine.
///
/// The engine records each transition and runs a pass on reconnect when
/// `sync_on_connect` is enabled. Stopping or dropping the monitor stops
/// forwarding; a reconnect pass already running is allowed to finish.
pub struct ConnectivityMonitor {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Start forwarding. The current reachability is applied immediately.
    pub fn spawn<T>(engine: &SyncEngine<T>, reachability: &dyn Reachability) -> Self
    where
        T: SyncTransport + ?Sized + 'static,
    {
        let mut receiver = reachability.subscribe();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let engine = engine.downgrade();

        let task = tokio::spawn(async move {
            let initial = *receiver.borrow_and_update();
            if !forward(&engine, initial).await {
                return;
            }
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        debug!("Connectivity monitor stopped");
                        return;
                    }
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let online = *receiver.borrow_and_update();
                if !forward(&engine, online).await {
                    return;
                }
            }
            debug!("Reachability source closed, connectivity monitor exiting");
        });

        Self { task, shutdown }
    }

    /// Ask the task to exit once the current transition is handled.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns `false` once the engine is gone.
async fn forward<T>(engine: &WeakSyncEngine<T>, online: bool) -> bool
where
    T: SyncTransport + ?Sized + 'static,
{
    let Some(engine) = engine.upgrade() else {
        return false;
    };
    match engine.set_online(online).await {
        Ok(Some(result)) => info!(
            "Reconnect sync: {} completed, {} failed",
            result.operations_completed, result.operations_failed
        ),
        Ok(None) => {}
        Err(e) => warn!("Failed to record connectivity change: {}", e),
    }
    true
}
