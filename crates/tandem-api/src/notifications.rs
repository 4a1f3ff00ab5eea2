//! Pull side of notification delivery. Clients poll on the advertised
//! interval, so a new notification shows up within one poll period.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use tandem_gateway::blocking;
use tandem_types::api::{Claims, NotificationListResponse, UnreadCountResponse};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<NotificationListResponse>, ApiError> {
    let db = state.db.clone();
    let notifications = blocking(move || db.list_notifications(claims.sub, query.limit)).await?;
    Ok(Json(NotificationListResponse {
        notifications,
        poll_interval_secs: state.notification_poll_secs,
    }))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let db = state.db.clone();
    let unread = blocking(move || db.unread_notification_count(claims.sub)).await?;
    Ok(Json(UnreadCountResponse { unread }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<i64>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    blocking(move || db.mark_notification_read(notification_id, claims.sub)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let updated = blocking(move || db.mark_all_notifications_read(claims.sub)).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}
