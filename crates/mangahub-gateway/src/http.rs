//! `/health` and `/metrics` endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use mangahub_bridge::{StatsSnapshot, UnifiedBridge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The bridge being reported on.
    pub bridge: Arc<UnifiedBridge>,
    /// Prometheus renderer, if a recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
    /// When the gateway started.
    pub start_time: Instant,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the dispatcher runs, `"stopped"` otherwise.
    pub status: &'static str,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Users with at least one connection.
    pub active_users: usize,
    /// Connections across all users.
    pub total_connections: usize,
    /// Events waiting in the bridge queue.
    pub queued_events: usize,
    /// Bridge counters.
    pub stats: StatsSnapshot,
}

/// Build a health response from the bridge's live counters.
pub fn health_check(state: &AppState) -> HealthResponse {
    let bridge = &state.bridge;
    HealthResponse {
        status: if bridge.is_running() { "ok" } else { "stopped" },
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_users: bridge.get_active_user_count(),
        total_connections: bridge.get_total_connection_count(),
        queued_events: bridge.queued_events(),
        stats: bridge.stats().snapshot(),
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve HTTP until cancelled.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) {
    let app = router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        warn!(error = %e, "http server failed");
    }
    debug!("http server stopped");
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_check(&state))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use mangahub_bridge::ClientConn;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn state(prometheus: Option<PrometheusHandle>) -> AppState {
        AppState {
            bridge: UnifiedBridge::with_defaults(),
            prometheus,
            start_time: Instant::now(),
        }
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 100_000).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_reports_bridge_counts() {
        let state = state(None);
        let _ = state
            .bridge
            .register_protocol_client(ClientConn::grpc("s1"), "u1");
        let _ = state
            .bridge
            .register_protocol_client(ClientConn::websocket("w1"), "u1");

        let (status, body) = get_body(router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "stopped");
        assert_eq!(parsed["active_users"], 1);
        assert_eq!(parsed["total_connections"], 2);
        assert_eq!(parsed["queued_events"], 0);
        assert_eq!(parsed["stats"]["registrations"]["grpc"], 1);
    }

    #[tokio::test]
    async fn health_is_ok_while_running() {
        let state = state(None);
        assert!(state.bridge.start());
        let resp = health_check(&state);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
        state.bridge.stop().await;
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_unavailable() {
        let (status, _) = get_body(router(state(None)), "/metrics").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_renders_prometheus_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let (status, _) = get_body(router(state(Some(handle))), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (status, _) = get_body(router(state(None)), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
