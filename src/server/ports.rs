use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::{Map, Value};

use crate::model::port::{PortId, PortUpdate, VersionTarget};
use crate::server::error::ApiResult;
use crate::server::views::{PatchView, PortView};
use crate::server::{check_writable, optional_string, required_string, AppState};

pub async fn list_ports(State(state): State<AppState>) -> ApiResult<Json<Vec<PortView>>> {
    let ports = state.registry.list_ports().await?;
    Ok(Json(ports.into_iter().map(PortView::from).collect()))
}

pub async fn get_port(
    State(state): State<AppState>,
    id: Result<Path<PortId>, PathRejection>,
) -> ApiResult<Json<PortView>> {
    let Path(id) = id?;
    Ok(Json(state.registry.get_port(id).await?.into()))
}

/// `{"source": "cran", "name": "dplyr"}`
pub async fn create_port(
    State(state): State<AppState>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    check_writable(&body, &["source", "name"])?;
    let source = required_string(&body, "source")?;
    let name = required_string(&body, "name")?;

    let (port, _) = state.registry.create_port(source, name).await?;
    Ok((StatusCode::CREATED, Json(PortView::from(port))))
}

/// `{"source": "latest" | "<version>", "maintainer": "<address>"}`
pub async fn update_port(
    State(state): State<AppState>,
    id: Result<Path<PortId>, PathRejection>,
    body: Result<Json<Map<String, Value>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let Json(body) = body?;
    check_writable(&body, &["source", "maintainer"])?;

    let update = PortUpdate {
        version: optional_string(&body, "source")?
            .map(str::parse::<VersionTarget>)
            .transpose()?,
        maintainer: optional_string(&body, "maintainer")?.map(str::to_string),
    };
    let patch = state.registry.update_port(id, update).await?;
    Ok((StatusCode::ACCEPTED, Json(PatchView::from(patch))))
}

pub async fn remove_port(
    State(state): State<AppState>,
    id: Result<Path<PortId>, PathRejection>,
) -> ApiResult<impl IntoResponse> {
    let Path(id) = id?;
    let patch = state.registry.remove_port(id).await?;
    Ok((StatusCode::ACCEPTED, Json(PatchView::from(patch))))
}
