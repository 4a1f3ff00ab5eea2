use std::sync::Arc;

use tandem_db::Database;
use tandem_gateway::peer_bus::PeerHttpBus;
use tandem_gateway::router::BroadcastRouter;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub router: BroadcastRouter,
    pub jwt_secret: String,
    /// Set only when envelopes arrive from peer processes over HTTP.
    pub peer_bus: Option<Arc<PeerHttpBus>>,
    pub notification_poll_secs: u64,
}
