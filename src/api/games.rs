use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, api_error, project_error, run_error};
use crate::projects::Project;
use crate::runs::ChatMessage;

const MAX_TITLE_CHARS: usize = 120;

pub fn games_router() -> Router<AppState> {
    Router::new()
        .route("/games", get(list_games).post(create_game))
        .route("/games/{slug}", get(get_game))
        .route("/games/{slug}/generate", post(generate_game))
}

#[derive(Debug, Default, Deserialize)]
struct CreateGameRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateGameRequest {
    prompt: String,
    #[serde(default)]
    chat_context: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateGameResponse {
    run_id: String,
}

async fn list_games(State(state): State<AppState>) -> Result<Json<Vec<Project>>, ApiError> {
    let projects = state.projects.list_projects().await.map_err(project_error)?;
    Ok(Json(projects))
}

/// The body is optional: no body (or `{}`) creates an untitled game.
async fn create_game(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Project>, ApiError> {
    let request: CreateGameRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CreateGameRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("invalid request body: {e}")))?
    };

    if let Some(title) = &request.title {
        let len = title.trim().chars().count();
        if len == 0 || len > MAX_TITLE_CHARS {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("title must be 1-{MAX_TITLE_CHARS} characters"),
            ));
        }
    }

    let project = state
        .projects
        .create_project(request.title.as_deref())
        .await
        .map_err(project_error)?;
    tracing::info!(slug = %project.slug, title = %project.title, "created game");
    Ok(Json(project))
}

async fn get_game(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let project = state.projects.get_project(&slug).await.map_err(project_error)?;
    Ok(Json(project))
}

#[tracing::instrument(skip_all, fields(slug = %slug))]
async fn generate_game(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(body): Json<GenerateGameRequest>,
) -> Result<Json<GenerateGameResponse>, ApiError> {
    // Whitespace-only text is accepted; the prompt builder trims it.
    if body.prompt.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "prompt must not be empty"));
    }
    if body.chat_context.iter().any(|m| m.content.is_empty()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "chat messages must not be empty",
        ));
    }

    let run = state
        .runs
        .enqueue(&slug, &body.prompt, body.chat_context)
        .await
        .map_err(run_error)?;
    Ok(Json(GenerateGameResponse { run_id: run.id }))
}
