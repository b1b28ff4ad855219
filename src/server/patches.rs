use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{Map, Value};

use crate::error::PortdError;
use crate::model::patch::{PatchId, PatchStatus};
use crate::registry::{log_key, PatchUpdate};
use crate::server::error::ApiResult;
use crate::server::views::PatchView;
use crate::server::{check_writable, optional_string, AppState};

pub async fn list_patches(State(state): State<AppState>) -> ApiResult<Json<Vec<PatchView>>> {
    let patches = state.registry.list_patches().await?;
    Ok(Json(patches.into_iter().map(PatchView::from).collect()))
}

pub async fn get_patch(
    State(state): State<AppState>,
    id: Result<Path<PatchId>, PathRejection>,
) -> ApiResult<Json<PatchView>> {
    let Path(id) = id?;
    Ok(Json(state.registry.get_patch(id).await?.into()))
}

/// `{"log": "...", "status": "commit"}`
pub async fn update_patch(
    State(state): State<AppState>,
    id: Result<Path<PatchId>, PathRejection>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<Json<PatchView>> {
    let Path(id) = id?;
    let Json(body) = body?;
    check_writable(&body, &["log", "status"])?;

    let update = PatchUpdate {
        log: optional_string(&body, "log")?.map(str::to_string),
        status: optional_string(&body, "status")?
            .map(str::parse::<PatchStatus>)
            .transpose()?,
    };
    let patch = state.registry.update_patch(id, update).await?;
    Ok(Json(patch.into()))
}

pub async fn retry_patch(
    State(state): State<AppState>,
    id: Result<Path<PatchId>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let patch = state.registry.retry_patch(id).await?;
    Ok((StatusCode::ACCEPTED, Json(PatchView::from(patch))))
}

pub async fn get_diff(
    State(state): State<AppState>,
    id: Result<Path<PatchId>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let patch = state.registry.get_patch(id).await?;
    let key = patch
        .diff
        .ok_or_else(|| PortdError::ArtifactNotFound(format!("diff of patch {}", id)))?;
    let diff = state.registry.artifact(&key).await?;
    Ok(([(header::CONTENT_TYPE, "text/x-diff; charset=utf-8")], diff))
}

pub async fn get_log(
    State(state): State<AppState>,
    log: Result<Path<String>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(log) = log?;
    let text = state.registry.artifact(&log_key(&log)).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}
