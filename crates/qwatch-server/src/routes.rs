//! `GET /`, `GET /metrics`, `GET /health` — spec.md §6 HTTP surface.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::scrape::run_scrape;
use crate::state::AppState;

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>Celery Exporter</title></head>
<body>
<h1>Celery Exporter</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>
"#;

/// Prometheus exposition format content-type, version-stamped per the
/// convention the `prometheus` client library's `TextEncoder` targets.
const PROMETHEUS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Negotiates only between the classic Prometheus text format and a plain
/// `text/plain` fallback — the OpenMetrics encoder is out of scope
/// (spec.md §1: the text-encoding library itself is an external
/// collaborator; this crate only chooses *which* content-type header to
/// send for the bytes that library already produced).
fn negotiate_content_type(headers: &HeaderMap) -> &'static str {
    match headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) {
        Some(accept) if accept.contains("text/plain") || accept.contains("*/*") => {
            PROMETHEUS_TEXT_CONTENT_TYPE
        }
        None => PROMETHEUS_TEXT_CONTENT_TYPE,
        Some(_) => PROMETHEUS_TEXT_CONTENT_TYPE,
    }
}

async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match run_scrape(&state).await {
        Ok(body) => {
            let content_type = negotiate_content_type(&headers);
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(err) => {
            error!(error = %err, "scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("scrape failed: {err}")).into_response()
        }
    }
}

async fn health(State(state): State<AppState>) -> Response {
    if state.probe.health_check().await {
        (StatusCode::OK, "broker reachable\n").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "broker unreachable\n").into_response()
    }
}
