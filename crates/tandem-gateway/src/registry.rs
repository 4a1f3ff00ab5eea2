use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};
use uuid::Uuid;

use tandem_types::error::ChatError;
use tandem_types::events::ServerEvent;

/// Per-connection outbound queue depth. A connection that falls this far
/// behind starts losing live events and catches up via `recent` instead.
const CONNECTION_QUEUE: usize = 256;

/// Tracks which open connections on this process are joined to which rooms.
///
/// Every operation is synchronous and never touches I/O; the lock is only
/// held for map updates and non-blocking `try_send`s.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<Uuid, ConnectionEntry>,
    /// channel_id -> connection ids joined to it
    rooms: HashMap<Uuid, HashSet<Uuid>>,
}

struct ConnectionEntry {
    user_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Newly joined. `first_in_room` is set when the room had no local
    /// connections before.
    Joined { first_in_room: bool },
    AlreadyJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaveOutcome {
    pub was_joined: bool,
    /// The room has no local connections left.
    pub room_empty: bool,
}

/// What a connection held at the moment it closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    pub user_id: Uuid,
    pub rooms: Vec<Uuid>,
    /// Rooms that became empty because of this close.
    pub emptied: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub delivered: usize,
    /// Recipients whose queue was full or already closed.
    pub dropped: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly opened connection. Returns its id and the receiver
    /// the transport drains.
    pub fn open(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        self.write().connections.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        debug!("Connection {} opened for user {}", conn_id, user_id);
        (conn_id, rx)
    }

    pub fn user_of(&self, conn_id: Uuid) -> Result<Uuid, ChatError> {
        self.read()
            .connections
            .get(&conn_id)
            .map(|c| c.user_id)
            .ok_or(ChatError::ConnectionClosed)
    }

    /// Subscribe a connection to a room. Idempotent. Callers are expected to
    /// have re-validated view rights just before.
    pub fn join(&self, conn_id: Uuid, channel_id: Uuid) -> Result<JoinOutcome, ChatError> {
        let mut state = self.write();
        let entry = state
            .connections
            .get_mut(&conn_id)
            .ok_or(ChatError::ConnectionClosed)?;

        if !entry.rooms.insert(channel_id) {
            return Ok(JoinOutcome::AlreadyJoined);
        }

        let room = state.rooms.entry(channel_id).or_default();
        let first_in_room = room.is_empty();
        room.insert(conn_id);
        Ok(JoinOutcome::Joined { first_in_room })
    }

    /// Remove a subscription. Never fails, joined or not.
    pub fn leave(&self, conn_id: Uuid, channel_id: Uuid) -> LeaveOutcome {
        let mut state = self.write();
        let was_joined = state
            .connections
            .get_mut(&conn_id)
            .is_some_and(|c| c.rooms.remove(&channel_id));

        if !was_joined {
            return LeaveOutcome {
                was_joined,
                room_empty: !state.rooms.contains_key(&channel_id),
            };
        }

        LeaveOutcome {
            was_joined,
            room_empty: remove_from_room(&mut state.rooms, channel_id, conn_id),
        }
    }

    /// Drop a connection and all its subscriptions. Returns `None` when the
    /// connection was already closed, so redundant close events are no-ops.
    pub fn close(&self, conn_id: Uuid) -> Option<ClosedConnection> {
        let mut state = self.write();
        let entry = state.connections.remove(&conn_id)?;

        let rooms: Vec<Uuid> = entry.rooms.into_iter().collect();
        let emptied = rooms
            .iter()
            .copied()
            .filter(|&channel_id| remove_from_room(&mut state.rooms, channel_id, conn_id))
            .collect();

        debug!("Connection {} closed ({} rooms)", conn_id, rooms.len());
        Some(ClosedConnection {
            user_id: entry.user_id,
            rooms,
            emptied,
        })
    }

    /// Deliver an event to every connection joined to `channel_id` on this
    /// process. Never waits: a full or closed queue counts as dropped.
    pub fn broadcast_local(&self, channel_id: Uuid, event: &ServerEvent) -> Delivery {
        let state = self.read();
        let mut delivery = Delivery::default();

        let Some(room) = state.rooms.get(&channel_id) else {
            return delivery;
        };

        for conn_id in room {
            let Some(entry) = state.connections.get(conn_id) else {
                continue;
            };
            match entry.tx.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    trace!("Dropped event for connection {}", conn_id);
                    delivery.dropped += 1;
                }
            }
        }
        delivery
    }

    /// Send a reply to one connection. Returns false if it could not be queued.
    pub fn send_to(&self, conn_id: Uuid, event: ServerEvent) -> bool {
        self.read()
            .connections
            .get(&conn_id)
            .is_some_and(|c| c.tx.try_send(event).is_ok())
    }

    pub fn is_joined(&self, conn_id: Uuid, channel_id: Uuid) -> bool {
        self.read()
            .connections
            .get(&conn_id)
            .is_some_and(|c| c.rooms.contains(&channel_id))
    }

    /// Connections of `user_id` currently joined to `channel_id`.
    pub fn connections_in_room(&self, user_id: Uuid, channel_id: Uuid) -> Vec<Uuid> {
        let state = self.read();
        state
            .rooms
            .get(&channel_id)
            .map(|room| {
                room.iter()
                    .copied()
                    .filter(|id| state.connections.get(id).is_some_and(|c| c.user_id == user_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Users with at least one connection joined to the room.
    pub fn users_in(&self, channel_id: Uuid) -> HashSet<Uuid> {
        let state = self.read();
        state
            .rooms
            .get(&channel_id)
            .map(|room| {
                room.iter()
                    .filter_map(|id| state.connections.get(id).map(|c| c.user_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_size(&self, channel_id: Uuid) -> usize {
        self.read().rooms.get(&channel_id).map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    // Nothing panics while holding the lock, so a poisoned lock still holds
    // consistent maps.
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Returns true if the room is now empty (and was removed).
fn remove_from_room(rooms: &mut HashMap<Uuid, HashSet<Uuid>>, channel_id: Uuid, conn_id: Uuid) -> bool {
    let Some(room) = rooms.get_mut(&channel_id) else {
        return true;
    };
    room.remove(&conn_id);
    if room.is_empty() {
        rooms.remove(&channel_id);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_types::error::ErrorReason;

    fn ping(channel_id: Uuid) -> ServerEvent {
        ServerEvent::MessageDeleted { channel_id, message_id: 1 }
    }

    #[test]
    fn join_is_idempotent_and_tracks_first_member() {
        let reg = ConnectionRegistry::new();
        let (a, _rx_a) = reg.open(Uuid::new_v4());
        let (b, _rx_b) = reg.open(Uuid::new_v4());
        let ch = Uuid::new_v4();

        assert_eq!(reg.join(a, ch).unwrap(), JoinOutcome::Joined { first_in_room: true });
        assert_eq!(reg.join(a, ch).unwrap(), JoinOutcome::AlreadyJoined);
        assert_eq!(reg.join(b, ch).unwrap(), JoinOutcome::Joined { first_in_room: false });
        assert_eq!(reg.room_size(ch), 2);
    }

    #[test]
    fn leave_never_errors() {
        let reg = ConnectionRegistry::new();
        let (a, _rx) = reg.open(Uuid::new_v4());
        let ch = Uuid::new_v4();

        assert_eq!(reg.leave(a, ch), LeaveOutcome { was_joined: false, room_empty: true });
        assert!(!reg.leave(Uuid::new_v4(), ch).was_joined);

        reg.join(a, ch).unwrap();
        assert_eq!(reg.leave(a, ch), LeaveOutcome { was_joined: true, room_empty: true });
        assert_eq!(reg.room_size(ch), 0);
    }

    #[test]
    fn close_runs_once_and_forbids_resurrection() {
        let reg = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (a, _rx_a) = reg.open(user);
        let (b, _rx_b) = reg.open(Uuid::new_v4());
        let (x, y) = (Uuid::new_v4(), Uuid::new_v4());
        reg.join(a, x).unwrap();
        reg.join(a, y).unwrap();
        reg.join(b, y).unwrap();

        let closed = reg.close(a).unwrap();
        assert_eq!(closed.user_id, user);
        assert_eq!(closed.rooms.len(), 2);
        assert_eq!(closed.emptied, vec![x]);
        assert!(reg.close(a).is_none());

        assert!(matches!(reg.join(a, x), Err(ChatError::ConnectionClosed)));
        assert_eq!(reg.room_size(x), 0);
        assert_eq!(reg.room_size(y), 1);
        assert_eq!(reg.connection_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_is_room_isolated() {
        let reg = ConnectionRegistry::new();
        let (a, mut rx_a) = reg.open(Uuid::new_v4());
        let (b, mut rx_b) = reg.open(Uuid::new_v4());
        let (room_a, room_b) = (Uuid::new_v4(), Uuid::new_v4());
        reg.join(a, room_a).unwrap();
        reg.join(b, room_b).unwrap();

        let d = reg.broadcast_local(room_b, &ping(room_b));
        assert_eq!(d, Delivery { delivered: 1, dropped: 0 });
        assert_eq!(rx_b.recv().await, Some(ping(room_b)));
        assert!(rx_a.try_recv().is_err());

        assert_eq!(reg.broadcast_local(Uuid::new_v4(), &ping(room_a)), Delivery::default());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let reg = ConnectionRegistry::new();
        let (a, _rx) = reg.open(Uuid::new_v4());
        let ch = Uuid::new_v4();
        reg.join(a, ch).unwrap();

        for _ in 0..CONNECTION_QUEUE {
            assert_eq!(reg.broadcast_local(ch, &ping(ch)).delivered, 1);
        }
        assert_eq!(reg.broadcast_local(ch, &ping(ch)), Delivery { delivered: 0, dropped: 1 });
    }

    #[test]
    fn presence_queries() {
        let reg = ConnectionRegistry::new();
        let user = Uuid::new_v4();
        let (a, _rx_a) = reg.open(user);
        let (b, _rx_b) = reg.open(user);
        let ch = Uuid::new_v4();
        reg.join(a, ch).unwrap();
        reg.join(b, ch).unwrap();

        assert_eq!(reg.users_in(ch).len(), 1);
        let mut conns = reg.connections_in_room(user, ch);
        conns.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(conns, expected);
        assert!(reg.is_joined(a, ch));
        assert_eq!(reg.user_of(a).unwrap(), user);

        assert!(reg.send_to(a, ServerEvent::JoinError { channel_id: ch, reason: ErrorReason::NotFound }));
        assert!(!reg.send_to(Uuid::new_v4(), ping(ch)));
    }
}
