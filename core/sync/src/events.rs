//! State-change notification for observers.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::SyncResult;

const EVENT_CAPACITY: usize = 64;

/// A state-mutating step the engine just completed.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Operations were added to or removed from the queue outside a pass.
    QueueChanged { pending: usize },
    /// A sync pass finished (not emitted for skipped passes).
    SyncCompleted(SyncResult),
    ConnectivityChanged { online: bool },
    ConflictResolved { conflict_id: String },
    ConfigChanged,
}

/// Fan-out of engine events.
///
/// Sending never waits on listeners; a listener that falls behind loses the
/// oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Raw receiver for callers that prefer to poll.
    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Deliver every event to `listener` on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncEvent) + Send + Sync + 'static,
    {
        let mut receiver = self.sender.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => listener(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Sync listener lagged, {} events dropped", missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Sync listener stopped");
        });
        Subscription { task: Some(task) }
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by `subscribe`; dropping it also unsubscribes.
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events to the listener.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
