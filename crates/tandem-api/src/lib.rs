pub mod channels;
pub mod error;
pub mod internal;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod projects;
pub mod state;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use tandem_gateway::peer_bus::BUS_INGRESS_PATH;

use crate::middleware::require_auth;
use crate::state::AppState;

/// Every REST route. Everything except bus ingress requires a user token.
pub fn routes(state: AppState) -> Router {
    let protected = Router::new()
        .route("/projects", post(projects::create_project))
        .route("/projects/{project_id}/members/{user_id}", put(projects::upsert_member))
        .route(
            "/projects/{project_id}/channels",
            get(channels::list_channels).post(channels::create_channel),
        )
        .route(
            "/channels/{channel_id}",
            get(channels::get_channel).patch(channels::update_channel),
        )
        .route(
            "/channels/{channel_id}/permissions/{user_id}",
            put(channels::grant_permission),
        )
        .route(
            "/channels/{channel_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/channels/{channel_id}/messages/{message_id}",
            delete(messages::delete_message),
        )
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread_count", get(notifications::unread_count))
        .route("/notifications/read_all", post(notifications::mark_all_read))
        .route("/notifications/{id}/read", post(notifications::mark_read))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state.clone());

    let internal = Router::new()
        .route(BUS_INGRESS_PATH, post(internal::bus_ingress))
        .with_state(state);

    Router::new().merge(protected).merge(internal)
}
