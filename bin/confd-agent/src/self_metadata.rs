//! This daemon's own remote metadata.
//!
//! Serves the same document the go-expvar family fetches from its services, describing this daemon's `/debug/vars`,
//! so a peer can monitor it like any other expvar service.

use axum::Router;
use confd_api::{extract::State, routing::get, APIHandler, Json};
use confd_common::telemetry::{MetricSample, MetricValue, MetricsRegistry};
use confd_sync::{MetricField, MetricSpec, RemoteFragment};

const PROJECT_TAG: &str = "project:confd-agent";

#[derive(Clone)]
pub struct SelfMetadataState {
    expvar_url: String,
    metrics: MetricsRegistry,
}

/// An API handler describing this daemon's metrics.
///
/// Routes:
///
/// - `GET /datadog/expvar`: a JSON fragment with `expvar_url`, `tags` and one `metrics` mapping per registered counter
///   and gauge.
pub struct SelfMetadataAPIHandler {
    state: SelfMetadataState,
}

impl SelfMetadataAPIHandler {
    pub fn new(advertise_address: &str, listen_port: u16, metrics: MetricsRegistry) -> Self {
        Self {
            state: SelfMetadataState {
                expvar_url: format!("http://{}:{}/debug/vars", advertise_address, listen_port),
                metrics,
            },
        }
    }

    async fn expvar_handler(State(state): State<SelfMetadataState>) -> Json<RemoteFragment> {
        Json(build_fragment(state.expvar_url, &state.metrics.snapshot()))
    }
}

impl APIHandler for SelfMetadataAPIHandler {
    type State = SelfMetadataState;

    fn generate_initial_state(&self) -> Self::State {
        self.state.clone()
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/datadog/expvar", get(Self::expvar_handler))
    }
}

fn build_fragment(expvar_url: String, samples: &[MetricSample]) -> RemoteFragment {
    RemoteFragment {
        expvar_url,
        tags: vec![PROJECT_TAG.to_string()],
        metrics: samples.iter().map(metric_spec).collect(),
    }
}

// Paths follow the `/debug/vars` layout: labelled metrics sit one level down, keyed by their joined label values.
fn metric_spec(sample: &MetricSample) -> MetricSpec {
    let path = if sample.labels.is_empty() {
        sample.name.clone()
    } else {
        let label_key = sample
            .labels
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}/{}", sample.name, label_key)
    };

    let metric_type = match sample.value {
        MetricValue::Counter(_) => "monotonic_counter",
        MetricValue::Gauge(_) => "gauge",
    };

    MetricSpec::from([
        ("path".to_string(), MetricField::Text(path)),
        ("type".to_string(), MetricField::from(metric_type)),
    ])
}
