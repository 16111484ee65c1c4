//! Optional Prometheus metrics endpoint, off unless `--metrics-port` (or
//! config) names a nonzero port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Router};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{error, info};

static GLOBAL_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
static REGISTER_ONCE: OnceCell<()> = OnceCell::new();
static SESSIONS_STARTED: OnceCell<IntCounter> = OnceCell::new();
static SESSIONS_ACTIVE: OnceCell<IntGauge> = OnceCell::new();

fn register_metrics() {
    REGISTER_ONCE.get_or_init(|| {
        let registry = &*GLOBAL_REGISTRY;
        let started = IntCounter::new("browser_agent_sessions_started_total", "Sessions started")
            .expect("create sessions_started counter");
        if let Err(err) = registry.register(Box::new(started.clone())) {
            error!(?err, "failed to register sessions_started counter");
        }
        let _ = SESSIONS_STARTED.set(started);

        let active = IntGauge::new("browser_agent_sessions_active", "Sessions currently running")
            .expect("create sessions_active gauge");
        if let Err(err) = registry.register(Box::new(active.clone())) {
            error!(?err, "failed to register sessions_active gauge");
        }
        let _ = SESSIONS_ACTIVE.set(active);
    });
}

pub fn record_session_started() {
    register_metrics();
    if let Some(counter) = SESSIONS_STARTED.get() {
        counter.inc();
    }
}

pub fn set_sessions_active(count: i64) {
    register_metrics();
    if let Some(gauge) = SESSIONS_ACTIVE.get() {
        gauge.set(count);
    }
}

pub fn spawn_metrics_server(port: Option<u16>) -> Option<JoinHandle<()>> {
    let port = port?;
    if port == 0 {
        return None;
    }

    register_metrics();
    let registry = Arc::new(GLOBAL_REGISTRY.clone());
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(%addr, "metrics server listening");
    Some(tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app.into_make_service()).await {
                    error!(?err, "metrics server exited with error");
                }
            }
            Err(err) => error!(?err, "failed to bind metrics listener"),
        }
    }))
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(?err, "failed to encode prometheus metrics");
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "metric encode error".to_string());
    }
    match String::from_utf8(buffer) {
        Ok(body) => (axum::http::StatusCode::OK, body),
        Err(err) => {
            error!(?err, "failed to convert prometheus metrics to utf8");
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "metric encode error".to_string())
        }
    }
}
