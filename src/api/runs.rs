use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use hyper::StatusCode;
use serde::Serialize;

use super::{ApiError, AppState, api_error};
use crate::runs::bus::Subscription;
use crate::runs::{Run, RunStatus};

pub fn runs_router() -> Router<AppState> {
    Router::new()
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/events", get(run_events))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelRunResponse {
    run_id: String,
    status: RunStatus,
}

fn run_not_found() -> ApiError {
    api_error(StatusCode::NOT_FOUND, "Run not found")
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    state.runs.get_run(&run_id).await.map(Json).ok_or_else(run_not_found)
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelRunResponse>, ApiError> {
    let run = state.runs.cancel(&run_id).await.ok_or_else(run_not_found)?;
    Ok(Json(CancelRunResponse {
        run_id: run.id,
        status: run.status,
    }))
}

/// Full history of the run followed by live events, one `data:` line per
/// envelope. The stream closes after `run_finished`.
async fn run_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state.runs.subscribe(&run_id).await.ok_or_else(run_not_found)?;
    tracing::debug!(run_id = %run_id, "client subscribed to run events");

    let sse = Sse::new(event_stream(subscription))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));
    Ok(([(header::HeaderName::from_static("x-accel-buffering"), "no")], sse))
}

fn event_stream(mut subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = subscription.next().await {
            match Event::default().json_data(&event) {
                Ok(sse_event) => yield Ok(sse_event),
                Err(e) => tracing::warn!(run_id = %event.run_id, error = %e, "failed to encode run event"),
            }
        }
    }
}
