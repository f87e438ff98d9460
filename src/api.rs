//! HTTP status endpoints for the proxy.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse},
    routing::get,
};

use crate::proxy::TcpProxy;

/// Create the status router: `/stats` and `/admin`.
pub fn router(proxy: Arc<TcpProxy>) -> Router {
    Router::new()
        .route("/stats", get(stats))
        .route("/admin", get(admin))
        .with_state(proxy)
}

/// GET /stats - auto-refreshing HTML table of per-server counters.
async fn stats(State(proxy): State<Arc<TcpProxy>>) -> Html<String> {
    Html(proxy.server_stats_html())
}

/// GET /admin - 200 with the proxy version while any server is healthy,
/// 500 otherwise.
async fn admin(State(proxy): State<Arc<TcpProxy>>) -> impl IntoResponse {
    let status = if proxy.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = format!("{{ \"version\" : \"{}\" }}", proxy.version());
    (status, [(header::CONTENT_TYPE, "text/html")], body)
}
