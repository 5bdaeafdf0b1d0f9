use std::sync::Arc;

use axum::Router;
use confd_api::{
    extract::{Path, State},
    response::{IntoResponse as _, Response},
    routing::get,
    APIHandler, StatusCode,
};
use confd_common::telemetry::MetricsRegistry;
use metrics::{counter, Counter};
use tracing::{debug, warn};

use crate::upstream::{UpstreamClient, UpstreamRequest, UpstreamStage};

const SERVER_SOFTWARE: &str = "confd-agent/fastcgi";
const STATUS_QUERY: &str = "json=1";

struct Telemetry {
    ok: Counter,
    invalid_port: Counter,
    connect_failed: Counter,
    protocol_failed: Counter,
    read_failed: Counter,
    bytes_sent: Counter,
}

impl Telemetry {
    fn new(metrics: &MetricsRegistry) -> Self {
        metrics.scoped(|| Self {
            ok: counter!("gateway_requests_total", "outcome" => "ok"),
            invalid_port: counter!("gateway_requests_total", "outcome" => "invalid_port"),
            connect_failed: counter!("gateway_requests_total", "outcome" => UpstreamStage::Connect.as_str()),
            protocol_failed: counter!("gateway_requests_total", "outcome" => UpstreamStage::Protocol.as_str()),
            read_failed: counter!("gateway_requests_total", "outcome" => UpstreamStage::Read.as_str()),
            bytes_sent: counter!("gateway_bytes_sent_total"),
        })
    }

    fn failed(&self, stage: UpstreamStage) -> &Counter {
        match stage {
            UpstreamStage::Connect => &self.connect_failed,
            UpstreamStage::Protocol => &self.protocol_failed,
            UpstreamStage::Read => &self.read_failed,
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    upstream: Arc<dyn UpstreamClient>,
    telemetry: Arc<Telemetry>,
}

/// An API handler forwarding php-fpm ping and status checks to FastCGI workers.
///
/// Routes:
///
/// - `GET /php-fpm/{project}/{host}/{port}/{check_type}`: calls `/{project}/internal/{check_type}` on the worker at
///   `host:port` and returns its body. Status checks ask for JSON output. Every failure, including a malformed port,
///   is answered with 500 Internal Server Error and a message naming what failed.
pub struct GatewayAPIHandler {
    state: GatewayState,
}

impl GatewayAPIHandler {
    pub fn new(upstream: Arc<dyn UpstreamClient>, metrics: &MetricsRegistry) -> Self {
        Self {
            state: GatewayState {
                upstream,
                telemetry: Arc::new(Telemetry::new(metrics)),
            },
        }
    }

    async fn check_handler(
        State(state): State<GatewayState>,
        Path((project, host, port, check_type)): Path<(String, String, String, String)>,
    ) -> Response {
        let port = match port.parse::<u16>() {
            Ok(port) => port,
            Err(e) => {
                state.telemetry.invalid_port.increment(1);
                warn!(%project, %host, %port, error = %e, "Rejected gateway request with invalid port.");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Invalid port {}: {}", port, e),
                )
                    .into_response();
            }
        };

        let request = build_request(&project, &check_type);
        match state.upstream.call(&host, port, request).await {
            Ok(body) => {
                state.telemetry.ok.increment(1);
                state.telemetry.bytes_sent.increment(body.len() as u64);
                debug!(%project, %host, port, %check_type, bytes_sent = body.len(), "Forwarded FastCGI response.");
                body.into_response()
            }
            Err(e) => {
                let stage = e.stage();
                state.telemetry.failed(stage).increment(1);
                warn!(%project, %host, port, %check_type, stage = stage.as_str(), error = %e, "FastCGI call failed.");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("{}: {}", stage.description(), e),
                )
                    .into_response()
            }
        }
    }
}

impl APIHandler for GatewayAPIHandler {
    type State = GatewayState;

    fn generate_initial_state(&self) -> Self::State {
        self.state.clone()
    }

    fn generate_routes(&self) -> Router<Self::State> {
        Router::new().route("/php-fpm/{project}/{host}/{port}/{check_type}", get(Self::check_handler))
    }
}

fn build_request(project: &str, check_type: &str) -> UpstreamRequest {
    let script = format!("/{}/internal/{}", project, check_type);
    let request = UpstreamRequest::default()
        .with_param("GATEWAY_INTERFACE", "CGI/1.1")
        .with_param("REQUEST_METHOD", "GET")
        .with_param("SCRIPT_FILENAME", script.clone())
        .with_param("SCRIPT_NAME", script)
        .with_param("SERVER_SOFTWARE", SERVER_SOFTWARE);

    if check_type == "status" {
        request
            .with_param("QUERY_STRING", STATUS_QUERY)
            .with_param("CONTENT_LENGTH", STATUS_QUERY.len().to_string())
            .with_stdin(STATUS_QUERY)
    } else {
        request
    }
}
