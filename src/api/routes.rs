//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;
use super::websocket;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/ws", get(websocket::ws_handler))
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        // Proxy service
        .route("/proxy/start", post(handlers::proxy::start))
        .route("/proxy/stop", post(handlers::proxy::stop))
        .route("/proxy/rotate", post(handlers::proxy::rotate))
        .route("/proxy/status", get(handlers::proxy::status))
        .route("/proxy/details", get(handlers::proxy::details))
        // Bulk HTTP tester
        .route("/http/test", post(handlers::http_test::start))
        .route("/http/test/stop", post(handlers::http_test::stop))
        .route("/http/test/status", get(handlers::http_test::status))
        .route("/http/test/history", get(handlers::http_test::history))
        .route(
            "/http/test/clear_history",
            post(handlers::http_test::clear_history),
        )
        // Cloudflare scanner
        .route("/scanner/cf/start", post(handlers::scanner::start))
        .route("/scanner/cf/stop", post(handlers::scanner::stop))
        .route("/scanner/cf/status", get(handlers::scanner::status))
        .route("/scanner/cf/history", get(handlers::scanner::history))
        .route(
            "/scanner/cf/clear_history",
            post(handlers::scanner::clear_history),
        )
        .route("/scanner/cf/ranges", get(handlers::scanner::ranges))
}
