//! Probe and metrics endpoints.
//!
//! `/healthz` answers as long as the process runs; `/readyz` only once the
//! controller has started watching. `/metrics` is served on its own address.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

use crate::metrics::Metrics;

/// Shared state of the probe server.
#[derive(Debug, Default)]
pub struct Health {
    ready: AtomicBool,
}

impl Health {
    /// Flip what `/readyz` answers.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// What `/readyz` answers.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

fn probe_routes(
    health: Arc<Health>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let healthz = warp::get().and(warp::path("healthz")).map(|| "ok");
    let readyz = warp::get()
        .and(warp::path("readyz"))
        .map(move || {
            if health.is_ready() {
                warp::reply::with_status("ok", StatusCode::OK)
            } else {
                warp::reply::with_status("not ready", StatusCode::SERVICE_UNAVAILABLE)
            }
        });
    healthz.or(readyz)
}

fn metrics_routes(
    metrics: Arc<Metrics>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path("metrics"))
        .and_then(move || {
            let metrics = metrics.clone();
            async move {
                Ok::<_, Infallible>(warp::reply::with_header(
                    metrics.encode(),
                    "content-type",
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                ))
            }
        })
}

/// Serve the probes on `addr` until the process exits.
pub async fn serve_probes(addr: SocketAddr, health: Arc<Health>) {
    info!(%addr, "Starting health probe server");
    warp::serve(probe_routes(health)).run(addr).await
}

/// Serve `/metrics` on `addr` until the process exits.
pub async fn serve_metrics(addr: SocketAddr, metrics: Arc<Metrics>) {
    info!(%addr, "Starting metrics server");
    warp::serve(metrics_routes(metrics)).run(addr).await
}
