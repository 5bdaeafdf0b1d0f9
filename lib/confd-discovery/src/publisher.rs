use std::sync::Arc;

use tokio::sync::watch;

use crate::RegistrySnapshot;

/// Publishes registry snapshots to subscribers.
///
/// Only the most recent snapshot is retained. A slow subscriber skips intermediate snapshots and sees the latest one
/// when it next asks.
#[derive(Clone)]
pub struct SnapshotPublisher {
    tx: Arc<watch::Sender<Arc<RegistrySnapshot>>>,
}

impl SnapshotPublisher {
    /// Creates a new `SnapshotPublisher` holding an empty snapshot.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(RegistrySnapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    /// Replaces the current snapshot and notifies every subscriber.
    pub fn publish(&self, snapshot: RegistrySnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    #[cfg(test)]
    pub(crate) fn latest(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Creates a new subscription.
    ///
    /// The snapshot current at subscription time counts as already seen.
    pub fn subscribe(&self) -> RegistrySubscription {
        RegistrySubscription { rx: self.tx.subscribe() }
    }
}

/// A subscriber's view of published snapshots.
pub struct RegistrySubscription {
    rx: watch::Receiver<Arc<RegistrySnapshot>>,
}

impl RegistrySubscription {
    /// Waits for a snapshot newer than the last one returned, and returns it.
    ///
    /// Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Arc<RegistrySnapshot>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}
