//! Process-local metrics registry.
//!
//! No global recorder is installed. The registry is created once at startup and handed to each component, which
//! registers its counters and gauges inside [`MetricsRegistry::scoped`] so the usual `metrics` macros resolve against
//! it.

use std::sync::{atomic::Ordering, Arc};

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::{AtomicStorage, Registry};

/// The current value of a single registered metric.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: MetricValue,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(f64),
}

/// A metrics recorder backed by atomic storage.
///
/// Cloning is cheap and every clone observes the same metrics.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry<Key, AtomicStorage>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::atomic()),
        }
    }

    /// Runs `f` with this registry installed as the thread-local recorder.
    ///
    /// Handles created inside `f` (for example with `counter!`) stay bound to this registry after `f` returns.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(self, f)
    }

    /// Returns the value of the counter with the given name and labels, if registered.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        self.registry
            .get_counter_handles()
            .into_iter()
            .find(|(key, _)| key_matches(key, name, labels))
            .map(|(_, counter)| counter.load(Ordering::Relaxed))
    }

    /// Returns the value of the gauge with the given name and labels, if registered.
    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.registry
            .get_gauge_handles()
            .into_iter()
            .find(|(key, _)| key_matches(key, name, labels))
            .map(|(_, gauge)| f64::from_bits(gauge.load(Ordering::Relaxed)))
    }

    /// Returns every registered counter and gauge, ordered by name and then labels.
    ///
    /// Histograms are accepted by the recorder but not reported.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let counters = self.registry.get_counter_handles().into_iter().map(|(key, counter)| {
            sample_from_key(&key, MetricValue::Counter(counter.load(Ordering::Relaxed)))
        });
        let gauges = self.registry.get_gauge_handles().into_iter().map(|(key, gauge)| {
            sample_from_key(&key, MetricValue::Gauge(f64::from_bits(gauge.load(Ordering::Relaxed))))
        });

        let mut samples = counters.chain(gauges).collect::<Vec<_>>();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}

fn key_matches(key: &Key, name: &str, labels: &[(&str, &str)]) -> bool {
    if key.name() != name {
        return false;
    }

    let mut actual = key.labels().map(|l| (l.key(), l.value())).collect::<Vec<_>>();
    let mut expected = labels.to_vec();
    actual.sort_unstable();
    expected.sort_unstable();
    actual == expected
}

fn sample_from_key(key: &Key, value: MetricValue) -> MetricSample {
    MetricSample {
        name: key.name().to_string(),
        labels: key
            .labels()
            .map(|l| (l.key().to_string(), l.value().to_string()))
            .collect(),
        value,
    }
}

impl Recorder for MetricsRegistry {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |c| c.clone().into())
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |g| g.clone().into())
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |h| h.clone().into())
    }
}
