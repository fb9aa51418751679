//! Migration run endpoints.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use submap_core::{NewRun, RunId};
use tracing::info;

use crate::error::ServerError;
use crate::json::{
    LogEntryResponse, PageParams, PageResponse, RunResponse, DEFAULT_LOG_PAGE_SIZE,
    DEFAULT_RUN_PAGE_SIZE,
};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/migrations", get(list_runs).post(create_run))
        .route("/migrations/:id", get(get_run))
        .route("/migrations/:id/logs", get(list_logs))
        .route("/migrations/:id/retry", post(retry_run))
        .route("/migrations/:id/cancel", post(cancel_run))
}

/// Runs, newest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(page): Query<PageParams>,
) -> Result<Json<PageResponse<RunResponse>>, ServerError> {
    let limit = page.limit_or(DEFAULT_RUN_PAGE_SIZE);
    let offset = page.offset();
    let runs = state.store.list_runs(limit, offset).await?;

    Ok(Json(PageResponse {
        count: state.store.count_runs().await?,
        limit,
        offset,
        results: runs.iter().map(RunResponse::from).collect(),
    }))
}

/// Create a run and dispatch it.
async fn create_run(
    State(state): State<AppState>,
    body: Result<Json<NewRun>, JsonRejection>,
) -> Result<(StatusCode, Json<RunResponse>), ServerError> {
    let Json(new) = body.map_err(|e| ServerError::BadRequest(e.body_text()))?;
    let run = state.dispatcher.submit(&new).await?;
    info!(run_id = run.id, from = run.from_messageset, to = run.to_messageset, "migration run submitted");
    Ok((StatusCode::CREATED, Json(RunResponse::from(&run))))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunResponse>, ServerError> {
    let run = state.store.get_run(id).await?;
    Ok(Json(RunResponse::from(&run)))
}

/// Log entries of a run in insertion order.
async fn list_logs(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
    Query(page): Query<PageParams>,
) -> Result<Json<PageResponse<LogEntryResponse>>, ServerError> {
    state.store.get_run(id).await?;
    let limit = page.limit_or(DEFAULT_LOG_PAGE_SIZE);
    let offset = page.offset();
    let entries = state.store.list_logs(id, limit, offset).await?;

    Ok(Json(PageResponse {
        count: state.store.count_logs(id).await?,
        limit,
        offset,
        results: entries.iter().map(LogEntryResponse::from).collect(),
    }))
}

async fn retry_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunResponse>, ServerError> {
    let run = state.dispatcher.retry(id).await?;
    Ok(Json(RunResponse::from(&run)))
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunResponse>, ServerError> {
    let run = state.dispatcher.cancel(id).await?;
    Ok(Json(RunResponse::from(&run)))
}
