mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use tandem_api::middleware::{bearer_token, decode_claims};
use tandem_api::state::AppStateInner;
use tandem_db::Database;
use tandem_gateway::blocking;
use tandem_gateway::bus::{FanoutBus, LocalBus, NoopBus};
use tandem_gateway::connection::{self, SocketUser};
use tandem_gateway::peer_bus::PeerHttpBus;
use tandem_gateway::router::BroadcastRouter;

use crate::config::{BusMode, ServerConfig};

#[derive(Clone)]
struct GatewayState {
    router: BroadcastRouter,
    jwt_secret: String,
    notification_poll_secs: u64,
}

#[derive(Debug, serde::Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem=debug,tower_http=debug".into()),
        )
        .init();

    let cfg = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(
        Database::open(&cfg.db_path)?
            .with_private_default(cfg.private_default)
            .with_limits(cfg.limits),
    );
    // A restarted node holds no connections.
    let stale = db.presence_clear_node(cfg.node_id)?;
    if stale > 0 {
        info!("Cleared {} stale presence rows for node {}", stale, cfg.node_id);
    }

    let (bus, peer_bus): (Arc<dyn FanoutBus>, Option<Arc<PeerHttpBus>>) = match &cfg.bus {
        BusMode::Local => (Arc::new(LocalBus::new()), None),
        BusMode::None => (Arc::new(NoopBus::default()), None),
        BusMode::Peers(peers) => {
            let peer_bus = Arc::new(PeerHttpBus::new(peers.clone(), cfg.bus_secret.clone())?);
            info!("Fanout bus peers: {}", peer_bus.peers().join(", "));
            (peer_bus.clone(), Some(peer_bus))
        }
    };

    let router = BroadcastRouter::new(cfg.node_id, db.clone(), bus, cfg.presence);
    // Also expires presence left behind by nodes that died without closing.
    router.spawn_presence_heartbeat();

    let app_state = Arc::new(AppStateInner {
        db,
        router: router.clone(),
        jwt_secret: cfg.jwt_secret.clone(),
        peer_bus,
        notification_poll_secs: cfg.notification_poll_secs,
    });

    let gateway_state = GatewayState {
        router,
        jwt_secret: cfg.jwt_secret.clone(),
        notification_poll_secs: cfg.notification_poll_secs,
    };

    // Routes
    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway_state);

    let node_id = cfg.node_id;
    let app = Router::new()
        .merge(tandem_api::routes(app_state))
        .merge(ws_route)
        .route("/health", get(move || health(node_id)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Tandem node {} listening on {}", cfg.node_id, cfg.addr);

    let listener = tokio::net::TcpListener::bind(cfg.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn health(node_id: Uuid) -> impl IntoResponse {
    axum::Json(json!({ "status": "ok", "node_id": node_id }))
}

/// The token comes from `?token=` (browsers cannot set headers on a
/// WebSocket) or from a bearer header.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(query): Query<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let token = query
        .token
        .or_else(|| bearer_token(&headers))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = decode_claims(&state.jwt_secret, &token).ok_or(StatusCode::UNAUTHORIZED)?;

    let db = state.router.db().clone();
    let (id, name, avatar_url) = (claims.sub, claims.name.clone(), claims.avatar_url.clone());
    blocking(move || db.upsert_user(id, &name, avatar_url.as_deref()))
        .await
        .map_err(|e| {
            error!("Failed to record user {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let user = SocketUser {
        user_id: claims.sub,
        name: claims.name,
    };
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.router, user, state.notification_poll_secs)
    }))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
