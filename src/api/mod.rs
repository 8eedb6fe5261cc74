pub mod games;
pub mod middleware;
pub mod routes;
pub mod runs;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use hyper::StatusCode;
use serde_json::{Value, json};

use crate::projects::ProjectError;
use crate::projects::repository::ProjectRepository;
use crate::runs::error::RunError;
use crate::runs::manager::RunManager;

#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<dyn ProjectRepository>,
    pub runs: Arc<RunManager>,
    /// Served as static files under `/games`.
    pub games_dir: PathBuf,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub(crate) type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub(crate) fn project_error(err: ProjectError) -> ApiError {
    match err {
        ProjectError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "Game not found"),
        other => internal_error(other.to_string()),
    }
}

pub(crate) fn run_error(err: RunError) -> ApiError {
    match err {
        RunError::ProjectNotFound(_) => api_error(StatusCode::NOT_FOUND, "Game not found"),
        RunError::NotFound(_) => api_error(StatusCode::NOT_FOUND, "Run not found"),
        RunError::QueueClosed => api_error(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down"),
        other => internal_error(other.to_string()),
    }
}

fn internal_error(message: String) -> ApiError {
    tracing::error!(error = %message, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, message)
}
