use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use tandem_gateway::blocking;
use tandem_types::api::{Claims, SendMessageRequest};
use tandem_types::error::ChatError;
use tandem_types::models::MessageView;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Newest `limit` messages, oldest first. The store clamps `limit` to its cap.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<MessageView>>, ApiError> {
    let db = state.db.clone();
    let messages = blocking(move || db.recent(channel_id, claims.sub, query.limit)).await?;
    Ok(Json(messages))
}

/// Same path as the gateway's `send_message`: persist, broadcast, notify.
pub async fn send_message(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state
        .router
        .publish(claims.sub, channel_id, req.content, req.client_token)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((channel_id, message_id)): Path<(Uuid, i64)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let actual = blocking(move || db.message_channel(message_id)).await?;
    if actual != channel_id {
        return Err(ChatError::NotFound("message").into());
    }
    state.router.delete_message(claims.sub, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
