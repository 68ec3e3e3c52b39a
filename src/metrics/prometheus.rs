//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::state::ServerState;

lazy_static::lazy_static! {
    /// Total number of reconcile passes
    pub static ref RECONCILIATIONS: Counter = register_counter!(
        "noobaa_source_reconciliations_total",
        "Total number of reconcile passes"
    ).unwrap();

    /// Total number of reconcile errors by kind
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "noobaa_source_reconciliation_errors_total",
        "Total number of reconcile errors",
        &["kind"]
    ).unwrap();

    /// Reconcile pass duration histogram
    pub static ref RECONCILE_DURATION: Histogram = register_histogram!(
        "noobaa_source_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();

    /// Running adapter tasks
    pub static ref ADAPTERS_RUNNING: Gauge = register_gauge!(
        "noobaa_source_adapters_running",
        "Number of running adapters"
    ).unwrap();

    /// Notifications received from the RPC service
    pub static ref NOTIFICATIONS_RECEIVED: CounterVec = register_counter_vec!(
        "noobaa_source_notifications_received_total",
        "Total number of bucket notifications received",
        &["namespace", "name"]
    ).unwrap();

    /// Event deliveries by outcome
    pub static ref DELIVERIES_TOTAL: CounterVec = register_counter_vec!(
        "noobaa_source_deliveries_total",
        "Total number of event deliveries by outcome",
        &["outcome"]
    ).unwrap();

    /// Single delivery attempt duration
    pub static ref DELIVERY_DURATION: Histogram = register_histogram!(
        "noobaa_source_delivery_duration_seconds",
        "Duration of sink delivery attempts in seconds",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    /// Status subresource writes by outcome
    pub static ref STATUS_WRITES: CounterVec = register_counter_vec!(
        "noobaa_source_status_writes_total",
        "Total number of status writes by outcome",
        &["outcome"]
    ).unwrap();

    /// RPC reconnects after a lost notification stream
    pub static ref RPC_RECONNECTS: CounterVec = register_counter_vec!(
        "noobaa_source_rpc_reconnects_total",
        "Total number of RPC reconnects",
        &["namespace", "name"]
    ).unwrap();

    /// Last reported health per resource (1 = bad, 0 = good)
    pub static ref SOURCE_BAD: GaugeVec = register_gauge_vec!(
        "noobaa_source_is_bad",
        "Last reported is_bad per NooBaaSource (1 = bad, 0 = good)",
        &["namespace", "name"]
    ).unwrap();
}

/// Drop every per-resource series of a deleted NooBaaSource
pub fn forget_source(namespace: &str, name: &str) {
    let labels = [namespace, name];
    let _ = SOURCE_BAD.remove_label_values(&labels);
    let _ = NOTIFICATIONS_RECEIVED.remove_label_values(&labels);
    let _ = RPC_RECONNECTS.remove_label_values(&labels);
}

/// Start the metrics and health HTTP server
pub async fn serve(port: u16, state: ServerState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: ServerState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => flag_response(state.is_alive()),
        "/readyz" | "/ready" => flag_response(state.is_ready()),
        "/" => diagnostics_response(&state).await,
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(content_type) = encoder.format_type().parse() {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    response
}

/// Liveness and readiness: 200 while the flag is set, 503 otherwise
fn flag_response(up: bool) -> Response<Full<Bytes>> {
    if up {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    }
}

async fn diagnostics_response(state: &ServerState) -> Response<Full<Bytes>> {
    let diagnostics = state.diagnostics().await;
    match serde_json::to_vec(&diagnostics) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            error!("Failed to encode diagnostics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode diagnostics")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}
