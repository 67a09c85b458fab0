//! Metrics exposition: Prometheus recorder plus an axum server for /metrics.

use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "postvine-web";

/// Install the Prometheus recorder. Must be called once at startup, before
/// any counter is touched.
///
/// # Panics
///
/// Panics if a recorder is already installed.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Like [`init_metrics`] but returns `None` when a recorder is already
/// installed instead of panicking.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Pull-based metrics surface: `/metrics` renders the Prometheus text format,
/// `/healthz` answers liveness probes.
pub fn build_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
}

/// Bind and serve the metrics endpoint until the process exits.
pub async fn serve(port: u16, handle: PrometheusHandle) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("metrics server listening on http://{addr}/metrics");
    axum::serve(listener, build_router(handle)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::OnceLock;
    use tower::util::ServiceExt;

    fn test_handle() -> PrometheusHandle {
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        HANDLE
            .get_or_init(|| try_init_metrics().expect("first recorder install in test binary"))
            .clone()
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let app = build_router(test_handle());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_recorded_counters() {
        let handle = test_handle();
        metrics::counter!("records_processed_total").increment(3);

        let app = build_router(handle);
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("records_processed_total"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let app = build_router(test_handle());
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
