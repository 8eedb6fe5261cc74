use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use hyper::StatusCode;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use super::middleware;
use super::{AppState, games, runs};

pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route(
        "/",
        get(|| async {
            Json(json!({
                "status": "ok",
            }))
        }),
    );

    let api_routes = Router::new()
        .nest("/health", health_routes.clone())
        .merge(games::games_router())
        .merge(runs::runs_router());

    let static_games = ServeDir::new(&state.games_dir);

    Router::new()
        .nest("/health", health_routes)
        .nest("/api", api_routes)
        .nest_service("/games", static_games)
        .fallback(not_found)
        .with_state(state)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
        .layer(CorsLayer::permissive())
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, "Not Found")
}
