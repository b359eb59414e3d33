use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::deletion::{ApprovalCoordinator, ApproverDirectory};
use crate::middleware::auth::Authenticate;

pub mod handlers;

/// Shared application state passed to handlers.
pub struct AppState {
    pub coordinator: Arc<ApprovalCoordinator>,
    pub auth: Arc<dyn Authenticate>,
    /// Supplies approvers when a create call does not name them.
    pub directory: Arc<dyn ApproverDirectory>,
    pub default_backoff: Duration,
}

/// Build the admin API router.
/// All routes are relative; the caller mounts this under `/api/v1`.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/project/:project_id/environment/:environment_id",
            delete(handlers::delete_environment),
        )
        .route(
            "/project/:project_id/environment/:environment_id/deletion_request",
            post(handlers::create_deletion_request),
        )
        .route(
            "/project/:project_id/environment/:environment_id/deletion_request/:id",
            get(handlers::get_deletion_request),
        )
        .route(
            "/project/:project_id/environment/:environment_id/deletion_request/:id/confirmation/:code",
            post(handlers::approve_deletion_confirmation),
        )
        .route(
            "/project/:project_id/environment/:environment_id/deletion_request/:id/rejection/:code",
            post(handlers::reject_deletion_confirmation),
        )
        .fallback(fallback_404)
}

/// The complete HTTP application: health, metrics and the admin API.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api_router())
        .with_state(state)
        // Spans carry the route template, never the raw path: it holds codes.
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            let route = req
                .extensions()
                .get::<MatchedPath>()
                .map(MatchedPath::as_str)
                .unwrap_or("unmatched");
            tracing::debug_span!("http_request", method = %req.method(), route)
        }))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        state.coordinator.metrics().render(),
    )
}

/// Middleware: injects a unique X-Request-Id into every response so clients
/// can correlate errors with server logs.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: security headers on every response.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    // Confirmation codes travel in URLs.
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.remove("server");

    resp
}
