use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use tandem_gateway::blocking;
use tandem_types::api::{Claims, CreateProjectRequest, UpsertMemberRequest};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn create_project(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let creator = claims.sub;
    let project = blocking(move || db.create_project(&req.name, creator)).await?;
    info!("Project {} ({}) created by {}", project.name, project.id, creator);
    Ok((StatusCode::CREATED, Json(project)))
}

pub async fn upsert_member(
    State(state): State<AppState>,
    Path((project_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpsertMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    blocking(move || db.upsert_member(project_id, claims.sub, user_id, req.role)).await?;
    Ok(StatusCode::NO_CONTENT)
}
