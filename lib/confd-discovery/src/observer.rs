use std::{sync::Arc, time::Duration};

use confd_common::telemetry::MetricsRegistry;
use metrics::{counter, Counter};
use tokio::{
    select,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DiscoveryBackend, DiscoveryError, RegistrySubscription, SnapshotPublisher};

/// Polls a discovery backend and publishes what it finds.
pub struct RegistryObserver {
    backend: Arc<dyn DiscoveryBackend>,
    publisher: SnapshotPublisher,
    poll_interval: Duration,
    polls: Counter,
    poll_errors: Counter,
}

impl RegistryObserver {
    /// Creates a new `RegistryObserver`.
    pub fn new(backend: Arc<dyn DiscoveryBackend>, poll_interval: Duration, metrics: &MetricsRegistry) -> Self {
        let (polls, poll_errors) =
            metrics.scoped(|| (counter!("observer_polls_total"), counter!("observer_poll_errors_total")));

        Self {
            backend,
            publisher: SnapshotPublisher::new(),
            poll_interval,
            polls,
            poll_errors,
        }
    }

    /// Subscribes to the snapshots this observer publishes.
    pub fn subscribe(&self) -> RegistrySubscription {
        self.publisher.subscribe()
    }

    /// Fetches the full service list once and publishes it.
    ///
    /// On failure nothing is published and the previous snapshot stays current.
    ///
    /// # Errors
    ///
    /// If the backend fails, its error is returned.
    pub async fn poll_once(&self) -> Result<(), DiscoveryError> {
        self.polls.increment(1);

        match self.backend.list_services().await {
            Ok(snapshot) => {
                debug!(services = snapshot.len(), "Publishing registry snapshot.");
                self.publisher.publish(snapshot);
                Ok(())
            }
            Err(e) => {
                self.poll_errors.increment(1);
                Err(e)
            }
        }
    }

    /// Polls on every tick until `shutdown` is cancelled.
    ///
    /// The first poll happens immediately. A poll in progress when `shutdown` fires is allowed to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(poll_interval_secs = self.poll_interval.as_secs(), "Registry observer started.");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Failed to list services. Keeping previous snapshot.");
                    }
                }
            }
        }

        info!("Registry observer stopped.");
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;
    use confd_error::generic_error;
    use tokio::time::{advance, timeout};

    use super::*;
    use crate::{NodeIdentity, RegistrySnapshot, ServiceRecord};

    #[derive(Default)]
    struct ScriptedBackend {
        responses: Mutex<VecDeque<Result<RegistrySnapshot, DiscoveryError>>>,
    }

    impl ScriptedBackend {
        fn push_ok(&self, names: &[&str]) {
            let snapshot = names
                .iter()
                .map(|name| ServiceRecord::new(*name, *name, "10.0.0.1", 9000))
                .collect();
            self.responses.lock().unwrap().push_back(Ok(snapshot));
        }

        fn push_err(&self) {
            self.responses.lock().unwrap().push_back(Err(DiscoveryError::Unreachable {
                url: "http://127.0.0.1:8500/v1/agent/services".to_string(),
                source: generic_error!("connection refused"),
            }));
        }
    }

    #[async_trait]
    impl DiscoveryBackend for ScriptedBackend {
        async fn list_services(&self) -> Result<RegistrySnapshot, DiscoveryError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RegistrySnapshot::default()))
        }

        async fn self_info(&self) -> Result<NodeIdentity, DiscoveryError> {
            Ok(NodeIdentity {
                name: "node-1".to_string(),
                address: "10.0.0.1".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn failed_poll_keeps_previous_snapshot() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_ok(&["web-php-fpm"]);
        backend.push_err();

        let metrics = MetricsRegistry::new();
        let observer = RegistryObserver::new(backend, Duration::from_secs(5), &metrics);
        let mut subscription = observer.subscribe();

        observer.poll_once().await.unwrap();
        assert_eq!(subscription.changed().await.unwrap().len(), 1);

        assert!(observer.poll_once().await.is_err());
        assert_eq!(observer.publisher.latest().len(), 1);
        assert!(timeout(Duration::from_millis(20), subscription.changed()).await.is_err());

        assert_eq!(metrics.counter_value("observer_polls_total", &[]), Some(2));
        assert_eq!(metrics.counter_value("observer_poll_errors_total", &[]), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_on_each_tick_until_shutdown() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.push_ok(&["web-php-fpm"]);
        backend.push_ok(&["web-php-fpm", "api-go-expvar"]);

        let metrics = MetricsRegistry::new();
        let observer = RegistryObserver::new(backend, Duration::from_secs(5), &metrics);
        let mut subscription = observer.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(observer.run(shutdown.clone()));

        assert_eq!(subscription.changed().await.unwrap().len(), 1);

        advance(Duration::from_secs(5)).await;
        assert_eq!(subscription.changed().await.unwrap().len(), 2);

        shutdown.cancel();
        task.await.unwrap();
        assert!(subscription.changed().await.is_none());
    }
}
