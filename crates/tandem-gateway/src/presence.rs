//! "Who is currently looking at this channel", as seen by notification
//! fanout. Two strategies:
//!
//! - [`LocalPresence`] asks this process's registry only. Cheap, but a user
//!   watching the room through another process still gets a notification.
//! - [`SharedPresence`] mirrors joins into the shared database so every
//!   process sees every room member, at the cost of a write per join/leave.
//!   Each node beats every [`PRESENCE_HEARTBEAT`]; rows of a node silent for
//!   [`PRESENCE_TTL`] no longer count and are expired.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use tandem_db::Database;
use tandem_types::error::ChatError;

use crate::registry::ConnectionRegistry;

pub const PRESENCE_HEARTBEAT: Duration = Duration::from_secs(15);
pub const PRESENCE_TTL: Duration = Duration::from_secs(60);

/// Implementations may block; the router calls them from blocking tasks.
pub trait PresenceTracker: Send + Sync {
    fn joined(&self, connection_id: Uuid, user_id: Uuid, channel_id: Uuid) -> Result<(), ChatError>;

    fn left(&self, connection_id: Uuid, channel_id: Uuid) -> Result<(), ChatError>;

    fn closed(&self, connection_id: Uuid) -> Result<(), ChatError>;

    fn users_in(&self, channel_id: Uuid) -> Result<HashSet<Uuid>, ChatError>;

    /// Periodic liveness work. Returns how many stale entries were dropped.
    fn heartbeat(&self) -> Result<usize, ChatError> {
        Ok(0)
    }

    fn kind(&self) -> &'static str;
}

pub struct LocalPresence {
    registry: ConnectionRegistry,
}

impl LocalPresence {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }
}

impl PresenceTracker for LocalPresence {
    // The registry already holds the room state.
    fn joined(&self, _connection_id: Uuid, _user_id: Uuid, _channel_id: Uuid) -> Result<(), ChatError> {
        Ok(())
    }

    fn left(&self, _connection_id: Uuid, _channel_id: Uuid) -> Result<(), ChatError> {
        Ok(())
    }

    fn closed(&self, _connection_id: Uuid) -> Result<(), ChatError> {
        Ok(())
    }

    fn users_in(&self, channel_id: Uuid) -> Result<HashSet<Uuid>, ChatError> {
        Ok(self.registry.users_in(channel_id))
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

pub struct SharedPresence {
    db: Arc<Database>,
    node_id: Uuid,
}

impl SharedPresence {
    pub fn new(db: Arc<Database>, node_id: Uuid) -> Self {
        Self { db, node_id }
    }
}

impl PresenceTracker for SharedPresence {
    fn joined(&self, connection_id: Uuid, user_id: Uuid, channel_id: Uuid) -> Result<(), ChatError> {
        self.db.presence_join(self.node_id, connection_id, user_id, channel_id)
    }

    fn left(&self, connection_id: Uuid, channel_id: Uuid) -> Result<(), ChatError> {
        self.db.presence_leave(connection_id, channel_id)
    }

    fn closed(&self, connection_id: Uuid) -> Result<(), ChatError> {
        self.db.presence_drop_connection(connection_id)
    }

    fn users_in(&self, channel_id: Uuid) -> Result<HashSet<Uuid>, ChatError> {
        self.db.presence_users_in(channel_id, PRESENCE_TTL)
    }

    fn heartbeat(&self) -> Result<usize, ChatError> {
        self.db.presence_touch_node(self.node_id)?;
        self.db.presence_expire(PRESENCE_TTL)
    }

    fn kind(&self) -> &'static str {
        "shared"
    }
}
