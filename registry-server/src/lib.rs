pub mod http;
pub mod transport;

use axum::routing::{get, post};
use axum::Router;

/// Build the registry node's HTTP router: `/join`, `/heartbeat`, `/services`,
/// and the `GET /` health check, with request tracing and a 400 fallback for
/// anything else.
pub fn router(state: http::AppState) -> Router {
    Router::new()
        .route("/", get(http::health))
        .route("/join", post(http::join))
        .route("/heartbeat", post(http::heartbeat))
        .route("/services", get(http::services))
        .fallback(http::not_found)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
