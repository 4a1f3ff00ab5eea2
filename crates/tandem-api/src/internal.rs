use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use tracing::{trace, warn};

use tandem_gateway::bus::FanoutBus;
use tandem_types::events::BusEnvelope;

use crate::middleware::bearer_token;
use crate::state::AppState;

/// Envelopes POSTed by peer processes. Authenticated with the shared bus
/// secret rather than a user token.
pub async fn bus_ingress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(envelope): Json<BusEnvelope>,
) -> Result<StatusCode, StatusCode> {
    let bus = state.peer_bus.as_ref().ok_or(StatusCode::NOT_FOUND)?;

    let presented = bearer_token(&headers).ok_or(StatusCode::UNAUTHORIZED)?;
    if !bus.accepts(&presented) {
        warn!("Rejected bus envelope from {} with a bad secret", envelope.origin);
        return Err(StatusCode::UNAUTHORIZED);
    }

    let handlers = bus.ingest(envelope);
    trace!("Bus envelope delivered to {} local handlers", handlers);
    Ok(StatusCode::ACCEPTED)
}
