//! Tracing and metrics setup for the node service.
//!
//! Installs an env-filtered fmt subscriber and a Prometheus recorder, and serves
//! `/metrics`, `/live` and `/ready` over HTTP. In tests the recorder is installed once
//! and reused, and subscriber installation tolerates an existing global subscriber.

use anyhow::{Context, Result};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the tracing subscriber and the Prometheus recorder.
///
/// Log filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init_observability(service_name: &str) -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    let handle = install_metrics_recorder()?;
    tracing::info!(service = service_name, "observability initialized");
    Ok(handle)
}

fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }))
}

/// Serves Prometheus metrics and health endpoints on `addr` until the listener fails.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, metrics_router(handle).into_make_service()).await
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}
