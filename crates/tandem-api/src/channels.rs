use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use tandem_gateway::blocking;
use tandem_types::api::{
    ChannelListEntry, Claims, CreateChannelRequest, GrantPermissionRequest, UpdateChannelRequest,
};
use tandem_types::error::ChatError;
use tandem_types::permissions::Access;

use crate::error::ApiError;
use crate::state::AppState;

/// Channels of the project the caller can view, each with resolved access.
pub async fn list_channels(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ChannelListEntry>>, ApiError> {
    let db = state.db.clone();
    let channels = blocking(move || db.list_channels(project_id, claims.sub)).await?;
    Ok(Json(channels))
}

pub async fn create_channel(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let channel = blocking(move || {
        db.create_channel(
            project_id,
            claims.sub,
            &req.name,
            req.description.as_deref(),
            req.is_private,
        )
    })
    .await?;
    Ok((StatusCode::CREATED, Json(channel)))
}

pub async fn get_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<ChannelListEntry>, ApiError> {
    let db = state.db.clone();
    let (channel, access) = blocking(move || db.channel_access(channel_id, claims.sub)).await?;
    if !access.can_view {
        return Err(ChatError::denied(format!("cannot view #{}", channel.name)).into());
    }
    Ok(Json(ChannelListEntry { channel, access }))
}

/// Through the router: making a channel private ends live room membership
/// of everyone who can no longer view it.
pub async fn update_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state.router.update_channel(claims.sub, channel_id, req).await?;
    Ok(Json(channel))
}

/// Goes through the router so that losing view rights also ends any live
/// room membership.
pub async fn grant_permission(
    State(state): State<AppState>,
    Path((channel_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<GrantPermissionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let access = Access {
        can_view: req.can_view,
        can_post: req.can_post,
    };
    let permission = state
        .router
        .grant_permission(claims.sub, channel_id, user_id, access)
        .await?;
    Ok(Json(permission))
}
