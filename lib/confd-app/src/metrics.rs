//! Metrics introspection.

use std::collections::BTreeMap;

use axum::Router;
use confd_api::{extract::State, routing::get, APIHandler, Json};
use confd_common::telemetry::{MetricSample, MetricValue, MetricsRegistry};
use serde_json::{Map, Number, Value};

/// Emits the startup metrics for the application.
///
/// Sets the `running` gauge, labelled with the application version, to indicate start-up has completed.
pub fn emit_startup_metrics(metrics: &MetricsRegistry, version: &'static str) {
    metrics.scoped(|| metrics::gauge!("running", "version" => version).set(1.0));
}

/// An API handler exposing every registered metric as JSON.
///
/// Routes:
///
/// - `GET /debug/vars`: a JSON object with one key per metric name. Unlabelled metrics map to their value. Labelled
///   metrics map to an object keyed by their label values joined with commas, e.g.
///   `{"check_instances": {"go-expvar": 1, "php-fpm": 2}}`.
pub struct MetricsAPIHandler {
    metrics: MetricsRegistry,
}

impl MetricsAPIHandler {
    /// Creates a new `MetricsAPIHandler` over the given registry.
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self { metrics }
    }

    async fn vars_handler(State(metrics): State<MetricsRegistry>) -> Json<Value> {
        Json(render_vars(&metrics.snapshot()))
    }
}

impl APIHandler for MetricsAPIHandler {
    type State = MetricsRegistry;

    fn generate_initial_state(&self) -> Self::State {
        self.metrics.clone()
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/debug/vars", get(Self::vars_handler))
    }
}

/// Renders metric samples in the `/debug/vars` layout.
pub fn render_vars(samples: &[MetricSample]) -> Value {
    let mut root = BTreeMap::<String, Value>::new();

    for sample in samples {
        let value = sample_value(sample.value);
        if sample.labels.is_empty() {
            root.insert(sample.name.clone(), value);
            continue;
        }

        let label_key = sample
            .labels
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let nested = root
            .entry(sample.name.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = nested {
            map.insert(label_key, value);
        }
    }

    Value::Object(root.into_iter().collect())
}

fn sample_value(value: MetricValue) -> Value {
    match value {
        MetricValue::Counter(n) => Value::Number(n.into()),
        MetricValue::Gauge(v) if v.fract() == 0.0 && v.abs() < 9.0e15 => Value::Number((v as i64).into()),
        MetricValue::Gauge(v) => Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null),
    }
}
