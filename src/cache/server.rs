//! Local intercept endpoint
//!
//! A thin Axum front for the cache worker: every request that reaches it
//! is resolved through [`CacheWorker::handle`], so the application sees
//! identical behavior online and offline.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::Error;

use super::worker::{CacheWorker, ServedFrom, WorkerState};

pub struct InterceptState {
    pub worker: Arc<CacheWorker>,
}

/// Create the intercept router: a health probe plus a catch-all proxy.
pub fn create_intercept_router(state: Arc<InterceptState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .fallback(intercept_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    active: bool,
}

async fn health_handler(State(state): State<Arc<InterceptState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        active: state.worker.state() == WorkerState::Active,
    })
}

/// A top-level document load rather than a subresource fetch. Failed
/// navigations fall back to the cached shell.
fn is_navigation(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

async fn intercept_handler(
    State(state): State<Arc<InterceptState>>,
    request: Request<Body>,
) -> Response {
    let method = request.method().as_str().to_string();
    let url = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let navigation = is_navigation(request.headers());

    let result = if method.eq_ignore_ascii_case("GET") {
        state.worker.handle(&method, &url, navigation).await
    } else {
        // Mutation traffic keeps its body and content type on the way
        // through; only the caching layers are skipped.
        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        match axum::body::to_bytes(request.into_body(), usize::MAX).await {
            Ok(body) => {
                state
                    .worker
                    .passthrough(&method, &url, body.to_vec(), content_type.as_deref())
                    .await
            }
            Err(err) => Err(anyhow::anyhow!("failed to read request body: {err}")),
        }
    };

    match result {
        Ok(cached) => {
            let status =
                StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK);
            let mut response = Response::builder()
                .status(status)
                .header(
                    "x-served-from",
                    match cached.served_from {
                        ServedFrom::Cache => "cache",
                        ServedFrom::Network => "network",
                    },
                );
            if let Some(content_type) = cached.content_type {
                response = response.header(header::CONTENT_TYPE, content_type);
            }
            response
                .body(Body::from(cached.bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            warn!("intercept failed for {method} {url}: {err:#}");
            let status = match err.downcast_ref::<Error>() {
                Some(Error::OfflineMiss { .. }) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            (status, err.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigation_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_navigation(&headers));

        headers.insert(
            header::ACCEPT,
            "text/html,application/xhtml+xml".parse().unwrap(),
        );
        assert!(is_navigation(&headers));

        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(!is_navigation(&headers));
    }
}
