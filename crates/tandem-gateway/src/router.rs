//! Broadcast Router: persist first, then deliver.
//!
//! `publish` runs as its own task, so a caller that gives up waiting (a
//! dropped HTTP request, a closed socket) never cuts the sequence short.
//! Once `append` has committed, local delivery, bus publish and notification
//! fanout all run. If `append` fails none of them do.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_db::Database;
use tandem_types::error::{ChatError, ErrorReason};
use tandem_types::events::{BusEnvelope, BusPayload, ServerEvent, channel_topic};
use tandem_types::api::UpdateChannelRequest;
use tandem_types::models::{Channel, ChannelPermission, MessageView};
use tandem_types::permissions::Access;

use crate::blocking;
use crate::bus::{FanoutBus, SubscriptionId};
use crate::fanout::NotificationFanout;
use crate::presence::{LocalPresence, PRESENCE_HEARTBEAT, PresenceTracker, SharedPresence};
use crate::registry::{ConnectionRegistry, JoinOutcome};

/// How notification fanout decides who is watching a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceMode {
    /// Only connections on this process count.
    #[default]
    Local,
    /// Joins are mirrored to the database and seen by every process.
    Shared,
}

impl FromStr for PresenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown presence mode '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub struct BroadcastRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    node_id: Uuid,
    db: Arc<Database>,
    registry: ConnectionRegistry,
    bus: Arc<dyn FanoutBus>,
    presence: Arc<dyn PresenceTracker>,
    fanout: NotificationFanout,
    /// Held across append + local broadcast so local delivery order is
    /// commit order.
    sequencers: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Bus subscription per room with at least one local connection.
    subscriptions: Mutex<HashMap<Uuid, SubscriptionId>>,
    /// Serialises presence writes, each of which re-reads the registry.
    presence_gate: Mutex<()>,
}

impl BroadcastRouter {
    pub fn new(node_id: Uuid, db: Arc<Database>, bus: Arc<dyn FanoutBus>, mode: PresenceMode) -> Self {
        let registry = ConnectionRegistry::new();
        let presence: Arc<dyn PresenceTracker> = match mode {
            PresenceMode::Local => Arc::new(LocalPresence::new(registry.clone())),
            PresenceMode::Shared => Arc::new(SharedPresence::new(db.clone(), node_id)),
        };
        let fanout = NotificationFanout::new(db.clone(), presence.clone());

        info!(
            "Broadcast router {} ready (bus={}, presence={})",
            node_id,
            bus.kind(),
            presence.kind()
        );

        Self {
            inner: Arc::new(RouterInner {
                node_id,
                db,
                registry,
                bus,
                presence,
                fanout,
                sequencers: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                presence_gate: Mutex::new(()),
            }),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Keep this node's presence alive and expire rows of silent nodes.
    /// Ends once the router is dropped.
    pub fn spawn_presence_heartbeat(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRESENCE_HEARTBEAT);
            loop {
                ticker.tick().await;
                let Some(presence) = weak.upgrade().map(|inner| inner.presence.clone()) else {
                    break;
                };
                match blocking(move || presence.heartbeat()).await {
                    Ok(0) => {}
                    Ok(expired) => info!("Expired {} presence rows of silent nodes", expired),
                    Err(e) => warn!("Presence heartbeat failed: {}", e),
                }
            }
        })
    }

    /// Register a new connection (`Connecting -> Open`).
    pub fn connect(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        self.inner.registry.open(user_id)
    }

    /// Join a room after re-checking view rights against current rows.
    pub async fn join(&self, conn_id: Uuid, channel_id: Uuid) -> Result<Access, ChatError> {
        let inner = &self.inner;
        let user_id = inner.registry.user_of(conn_id)?;

        let db = inner.db.clone();
        let (channel, access) = blocking(move || db.channel_access(channel_id, user_id)).await?;
        if !access.can_view {
            return Err(ChatError::denied(format!("cannot view #{}", channel.name)));
        }

        match inner.registry.join(conn_id, channel_id)? {
            JoinOutcome::AlreadyJoined => return Ok(access),
            JoinOutcome::Joined { first_in_room } => {
                debug!(
                    "Connection {} joined #{} (first on this node: {})",
                    conn_id, channel.name, first_in_room
                );
            }
        }

        RouterInner::ensure_subscribed(inner, channel_id);
        settle_presence(inner.sync_presence(conn_id, channel_id), conn_id).await;
        Ok(access)
    }

    /// Never fails, joined or not.
    pub async fn leave(&self, conn_id: Uuid, channel_id: Uuid) {
        let inner = &self.inner;
        if !inner.registry.leave(conn_id, channel_id).was_joined {
            return;
        }
        inner.release_if_empty(channel_id);
        settle_presence(inner.sync_presence(conn_id, channel_id), conn_id).await;
    }

    /// Tear down a connection. Safe to call more than once; only the first
    /// call does anything.
    pub async fn close(&self, conn_id: Uuid) {
        let inner = &self.inner;
        let Some(closed) = inner.registry.close(conn_id) else {
            return;
        };
        for channel_id in &closed.emptied {
            inner.release_if_empty(*channel_id);
        }
        settle_presence(inner.sync_closed(conn_id), conn_id).await;
    }

    /// Persist and deliver a message. Returns the stored copy; delivery
    /// problems after the commit are logged, never returned.
    pub async fn publish(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        content: String,
        client_token: Option<String>,
    ) -> Result<MessageView, ChatError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.publish(user_id, channel_id, content, client_token).await })
            .await
            .map_err(|e| ChatError::Storage(anyhow::anyhow!("publish task failed: {}", e)))?
    }

    /// Author-initiated delete, fanned out like a publish.
    pub async fn delete_message(&self, user_id: Uuid, message_id: i64) -> Result<(), ChatError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.delete_message(user_id, message_id).await })
            .await
            .map_err(|e| ChatError::Storage(anyhow::anyhow!("delete task failed: {}", e)))?
    }

    /// Edit a channel. Making it private re-checks the room on every process
    /// and evicts connections whose user can no longer view it.
    pub async fn update_channel(
        &self,
        actor: Uuid,
        channel_id: Uuid,
        update: UpdateChannelRequest,
    ) -> Result<Channel, ChatError> {
        let inner = &self.inner;
        let narrows = update.is_private == Some(true);
        let db = inner.db.clone();
        let channel = blocking(move || db.update_channel(channel_id, actor, &update)).await?;
        if !narrows {
            return Ok(channel);
        }

        let db = inner.db.clone();
        match blocking(move || db.channel_viewers(channel_id)).await {
            Ok((_, viewers)) => {
                let evicted = inner.restrict_local(channel_id, &viewers);
                if evicted > 0 {
                    info!("#{} went private, evicted {} connections", channel.name, evicted);
                }
                inner
                    .broadcast_remote(channel_id, BusPayload::Restrict { channel_id, viewers })
                    .await;
            }
            Err(e) => warn!("Could not re-check room of #{}: {}", channel.name, e),
        }
        Ok(channel)
    }

    /// Write a permission row. When view rights are taken away, that user's
    /// live connections are evicted from the room on every process.
    pub async fn grant_permission(
        &self,
        actor: Uuid,
        channel_id: Uuid,
        user_id: Uuid,
        access: Access,
    ) -> Result<ChannelPermission, ChatError> {
        let inner = &self.inner;
        let db = inner.db.clone();
        let permission = blocking(move || {
            db.grant_permission(channel_id, actor, user_id, access.can_view, access.can_post)
        })
        .await?;

        if !permission.can_view {
            let evicted = inner.evict_local(channel_id, user_id);
            if evicted > 0 {
                info!("Evicted {} connections of {} from {}", evicted, user_id, channel_id);
            }
            inner
                .broadcast_remote(channel_id, BusPayload::Revoke { channel_id, user_id })
                .await;
        }
        Ok(permission)
    }
}

impl RouterInner {
    async fn publish(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        content: String,
        client_token: Option<String>,
    ) -> Result<MessageView, ChatError> {
        let sequencer = self.sequencer(channel_id);
        let committed = {
            let _turn = sequencer.lock().await;

            let db = self.db.clone();
            let appended =
                blocking(move || db.append(channel_id, user_id, &content, client_token.as_deref())).await;

            if let Ok(view) = &appended {
                let event = ServerEvent::MessageCreated { message: view.clone() };
                let delivery = self.registry.broadcast_local(channel_id, &event);
                if delivery.dropped > 0 {
                    warn!(
                        "Local broadcast in {}: {} delivered, {} dropped",
                        channel_id, delivery.delivered, delivery.dropped
                    );
                }
            }
            appended
        };
        self.release_sequencer(channel_id, sequencer);
        let view = committed?;

        let event = ServerEvent::MessageCreated { message: view.clone() };
        self.broadcast_remote(channel_id, BusPayload::Room { event }).await;

        let fanout = self.fanout.clone();
        let notified = view.clone();
        if let Err(e) = blocking(move || fanout.notify(&notified)).await {
            warn!("Notification fanout for message {} failed: {}", view.message.id, e);
        }

        Ok(view)
    }

    async fn delete_message(&self, user_id: Uuid, message_id: i64) -> Result<(), ChatError> {
        let db = self.db.clone();
        let message = blocking(move || db.delete_message(message_id, user_id)).await?;

        let channel_id = message.channel_id;
        let event = ServerEvent::MessageDeleted { channel_id, message_id };
        self.registry.broadcast_local(channel_id, &event);
        self.broadcast_remote(channel_id, BusPayload::Room { event }).await;
        Ok(())
    }

    async fn broadcast_remote(&self, channel_id: Uuid, payload: BusPayload) {
        let envelope = BusEnvelope {
            origin: self.node_id,
            topic: channel_topic(channel_id),
            payload,
        };
        if let Err(e) = self.bus.publish(envelope).await {
            warn!("Bus publish for {} degraded: {}", channel_id, e);
        }
    }

    /// Bus handler. Envelopes from this node were already acted on locally.
    fn handle_remote(self: &Arc<Self>, envelope: BusEnvelope) {
        if envelope.origin == self.node_id {
            return;
        }
        match envelope.payload {
            BusPayload::Room { event } => {
                if let Some(channel_id) = event.room() {
                    self.registry.broadcast_local(channel_id, &event);
                }
            }
            BusPayload::Revoke { channel_id, user_id } => {
                self.evict_local(channel_id, user_id);
            }
            BusPayload::Restrict { channel_id, viewers } => {
                self.restrict_local(channel_id, &viewers);
            }
        }
    }

    /// Evict every local room member whose user is not in `viewers`.
    fn restrict_local(self: &Arc<Self>, channel_id: Uuid, viewers: &[Uuid]) -> usize {
        self.registry
            .users_in(channel_id)
            .into_iter()
            .filter(|user_id| !viewers.contains(user_id))
            .map(|user_id| self.evict_local(channel_id, user_id))
            .sum()
    }

    /// Remove every local connection of `user_id` from the room and tell
    /// each one why.
    fn evict_local(self: &Arc<Self>, channel_id: Uuid, user_id: Uuid) -> usize {
        let conns = self.registry.connections_in_room(user_id, channel_id);
        for &conn_id in &conns {
            self.registry.leave(conn_id, channel_id);
            self.registry.send_to(
                conn_id,
                ServerEvent::JoinError {
                    channel_id,
                    reason: ErrorReason::PermissionDenied,
                },
            );
            // Detached: the write re-reads the registry, so it cannot undo a
            // later re-join.
            drop(self.sync_presence(conn_id, channel_id));
        }
        if !conns.is_empty() {
            self.release_if_empty(channel_id);
        }
        conns.len()
    }

    /// Bring presence for `(conn_id, channel_id)` in line with the registry.
    /// The task is spawned before returning and reads the registry under
    /// `presence_gate`, so a caller that stops waiting, or writes landing out
    /// of order, still leave presence matching the last registry change.
    fn sync_presence(self: &Arc<Self>, conn_id: Uuid, channel_id: Uuid) -> JoinHandle<Result<(), ChatError>> {
        let inner = self.clone();
        tokio::task::spawn_blocking(move || {
            let _gate = lock(&inner.presence_gate);
            let member = inner
                .registry
                .is_joined(conn_id, channel_id)
                .then(|| inner.registry.user_of(conn_id).ok())
                .flatten();
            match member {
                Some(user_id) => inner.presence.joined(conn_id, user_id, channel_id),
                None => inner.presence.left(conn_id, channel_id),
            }
        })
    }

    fn sync_closed(self: &Arc<Self>, conn_id: Uuid) -> JoinHandle<Result<(), ChatError>> {
        let inner = self.clone();
        tokio::task::spawn_blocking(move || {
            let _gate = lock(&inner.presence_gate);
            if inner.registry.user_of(conn_id).is_ok() {
                return Ok(());
            }
            inner.presence.closed(conn_id)
        })
    }

    fn ensure_subscribed(this: &Arc<Self>, channel_id: Uuid) {
        let mut subs = lock(&this.subscriptions);
        if subs.contains_key(&channel_id) {
            return;
        }
        let weak: Weak<RouterInner> = Arc::downgrade(this);
        let id = this.bus.subscribe(
            &channel_topic(channel_id),
            Arc::new(move |envelope: BusEnvelope| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_remote(envelope);
                }
            }),
        );
        subs.insert(channel_id, id);
    }

    /// Drop the bus subscription once no local connection is in the room.
    /// Checked under the subscription lock so a concurrent join wins.
    fn release_if_empty(&self, channel_id: Uuid) {
        let mut subs = lock(&self.subscriptions);
        if self.registry.room_size(channel_id) > 0 {
            return;
        }
        if let Some(id) = subs.remove(&channel_id) {
            self.bus.unsubscribe(id);
        }
    }

    fn sequencer(&self, channel_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.sequencers).entry(channel_id).or_default().clone()
    }

    /// Forget a channel's sequencer when nobody else holds it.
    fn release_sequencer(&self, channel_id: Uuid, sequencer: Arc<tokio::sync::Mutex<()>>) {
        let mut map = lock(&self.sequencers);
        // Ours plus the map's.
        if Arc::strong_count(&sequencer) == 2 {
            map.remove(&channel_id);
        }
    }
}

async fn settle_presence(task: JoinHandle<Result<(), ChatError>>, conn_id: Uuid) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Presence update failed for {}: {}", conn_id, e),
        Err(e) => warn!("Presence task for {} failed: {}", conn_id, e),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, NoopBus};
    use tandem_types::models::{Channel, ProjectRole};
    use tandem_types::timeline::Timeline;

    struct World {
        db: Arc<Database>,
        admin: Uuid,
        alice: Uuid,
        bob: Uuid,
        carol: Uuid,
        dave: Uuid,
        project: Uuid,
    }

    impl World {
        fn new() -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            let admin = Uuid::new_v4();
            db.upsert_user(admin, "admin", None).unwrap();
            let project = db.create_project("Apollo", admin).unwrap().id;

            let mut ids = vec![];
            for name in ["alice", "bob", "carol", "dave"] {
                let id = Uuid::new_v4();
                db.upsert_user(id, name, None).unwrap();
                db.upsert_member(project, admin, id, ProjectRole::Member).unwrap();
                ids.push(id);
            }
            Self {
                db,
                admin,
                alice: ids[0],
                bob: ids[1],
                carol: ids[2],
                dave: ids[3],
                project,
            }
        }

        fn channel(&self, name: &str, private: bool) -> Channel {
            self.db.create_channel(self.project, self.admin, name, None, private).unwrap()
        }

        fn router(&self) -> BroadcastRouter {
            BroadcastRouter::new(Uuid::new_v4(), self.db.clone(), Arc::new(NoopBus::default()), PresenceMode::Local)
        }
    }

    fn created(event: Option<ServerEvent>) -> MessageView {
        match event {
            Some(ServerEvent::MessageCreated { message }) => message,
            other => panic!("expected message_created, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn public_post_reaches_room_without_self_notification() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = w.router();

        let (alice_conn, mut alice_rx) = router.connect(w.alice);
        let (bob_conn, mut bob_rx) = router.connect(w.bob);
        assert_eq!(router.join(alice_conn, general.id).await.unwrap(), Access::FULL);
        router.join(bob_conn, general.id).await.unwrap();

        let view = router.publish(w.alice, general.id, "hi".into(), None).await.unwrap();
        assert_eq!(created(bob_rx.recv().await).message.content, "hi");
        assert_eq!(created(alice_rx.recv().await).message.id, view.message.id);

        assert_eq!(w.db.get_channel(general.id).unwrap().message_count, 1);
        assert!(w.db.list_notifications(w.alice, 10).unwrap().is_empty());
        assert!(w.db.list_notifications(w.bob, 10).unwrap().is_empty());
        // Not joined, so notified.
        assert_eq!(w.db.unread_notification_count(w.carol).unwrap(), 1);
    }

    #[tokio::test]
    async fn view_only_grant_rejects_post_without_side_effects() {
        let w = World::new();
        let leads = w.channel("leads", true);
        let router = w.router();
        router
            .grant_permission(w.admin, leads.id, w.bob, Access { can_view: true, can_post: false })
            .await
            .unwrap();

        let (admin_conn, mut admin_rx) = router.connect(w.admin);
        router.join(admin_conn, leads.id).await.unwrap();

        let err = router.publish(w.bob, leads.id, "hello".into(), None).await.unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
        assert!(admin_rx.try_recv().is_err());
        assert_eq!(w.db.get_channel(leads.id).unwrap().message_count, 0);
        assert!(w.db.recent(leads.id, w.admin, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn absent_viewer_gets_a_notification_instead_of_an_event() {
        let w = World::new();
        let leads = w.channel("leads", true);
        let router = w.router();
        let full = Access::FULL;
        router.grant_permission(w.admin, leads.id, w.carol, full).await.unwrap();
        router.grant_permission(w.admin, leads.id, w.dave, full).await.unwrap();

        // Carol is connected but has not opened the channel.
        let (_carol_conn, mut carol_rx) = router.connect(w.carol);
        let (dave_conn, _dave_rx) = router.connect(w.dave);
        router.join(dave_conn, leads.id).await.unwrap();

        router.publish(w.dave, leads.id, "ship it".into(), None).await.unwrap();

        assert!(carol_rx.try_recv().is_err());
        let notes = w.db.list_notifications(w.carol, 10).unwrap();
        assert_eq!(notes.len(), 1);
        assert!(!notes[0].is_read);
        assert_eq!(notes[0].title, "New message in #leads");
        // Alice and Bob cannot view the channel.
        assert_eq!(w.db.unread_notification_count(w.alice).unwrap(), 0);
        assert_eq!(w.db.unread_notification_count(w.dave).unwrap(), 0);
    }

    #[tokio::test]
    async fn missed_echo_is_recovered_by_backfill() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = w.router();

        let mut timeline = Timeline::new(general.id);
        let token = timeline.compose("are we live?");
        // The sender never joined, standing in for a dropped echo.
        let stored = router
            .publish(w.alice, general.id, "are we live?".into(), Some(token.clone()))
            .await
            .unwrap();
        assert_eq!(timeline.pending().len(), 1);

        let window = w.db.recent(general.id, w.alice, 50).unwrap();
        assert_eq!(timeline.backfill(window.clone()), 1);
        assert!(timeline.pending().is_empty());
        assert_eq!(timeline.backfill(window), 0);
        let ids: Vec<i64> = timeline.messages().map(|m| m.message.id).collect();
        assert_eq!(ids, vec![stored.message.id]);
    }

    #[tokio::test]
    async fn failed_persistence_means_no_broadcast_and_no_notification() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = w.router();
        let (conn, mut rx) = router.connect(w.bob);
        router.join(conn, general.id).await.unwrap();

        w.db.with_conn(|c| c.execute_batch("DROP TABLE messages").map_err(anyhow::Error::from))
            .unwrap();

        let err = router.publish(w.alice, general.id, "lost".into(), None).await.unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(w.db.unread_notification_count(w.carol).unwrap(), 0);
        assert_eq!(w.db.get_channel(general.id).unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let w = World::new();
        let (a, b) = (w.channel("a", false), w.channel("b", false));
        let router = w.router();
        let (conn, mut rx) = router.connect(w.bob);
        router.join(conn, a.id).await.unwrap();

        router.publish(w.alice, b.id, "for b".into(), None).await.unwrap();
        router.publish(w.alice, a.id, "for a".into(), None).await.unwrap();

        assert_eq!(created(rx.recv().await).message.content, "for a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_rechecks_view_rights() {
        let w = World::new();
        let leads = w.channel("leads", true);
        let router = w.router();
        let (conn, _rx) = router.connect(w.bob);

        assert!(matches!(router.join(conn, leads.id).await, Err(ChatError::PermissionDenied(_))));
        assert!(matches!(router.join(conn, Uuid::new_v4()).await, Err(ChatError::NotFound("channel"))));
        assert!(!router.registry().is_joined(conn, leads.id));

        router.close(conn).await;
        router.close(conn).await;
        let general = w.channel("general", false);
        assert!(matches!(router.join(conn, general.id).await, Err(ChatError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn concurrent_posts_arrive_in_commit_order() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = w.router();
        let (conn, mut rx) = router.connect(w.bob);
        router.join(conn, general.id).await.unwrap();

        let mut handles = vec![];
        for i in 0..20 {
            let router = router.clone();
            let author = if i % 2 == 0 { w.alice } else { w.carol };
            handles.push(tokio::spawn(async move {
                router.publish(author, general.id, format!("m{}", i), None).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let mut seen = vec![];
        for _ in 0..20 {
            seen.push(created(rx.recv().await).message.ordering_key());
        }
        assert!(seen.windows(2).all(|p| p[0] < p[1]));
    }

    #[tokio::test]
    async fn revoking_view_evicts_live_connections() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = w.router();
        let (conn, mut rx) = router.connect(w.bob);
        router.join(conn, general.id).await.unwrap();

        router
            .grant_permission(w.admin, general.id, w.bob, Access::NONE)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::JoinError { channel_id: general.id, reason: ErrorReason::PermissionDenied })
        );
        assert!(!router.registry().is_joined(conn, general.id));

        router.publish(w.alice, general.id, "secret".into(), None).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn two_nodes_share_one_bus() {
        let w = World::new();
        let general = w.channel("general", false);
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let node_a = BroadcastRouter::new(Uuid::new_v4(), w.db.clone(), bus.clone(), PresenceMode::Shared);
        let node_b = BroadcastRouter::new(Uuid::new_v4(), w.db.clone(), bus.clone(), PresenceMode::Shared);

        let (alice_conn, mut alice_rx) = node_a.connect(w.alice);
        let (bob_conn, mut bob_rx) = node_b.connect(w.bob);
        node_a.join(alice_conn, general.id).await.unwrap();
        node_b.join(bob_conn, general.id).await.unwrap();
        assert_eq!(bus.topic_count(), 1);

        let view = node_a.publish(w.alice, general.id, "cross".into(), None).await.unwrap();
        assert_eq!(created(bob_rx.recv().await).message.id, view.message.id);
        // Exactly once on the origin node.
        assert_eq!(created(alice_rx.recv().await).message.id, view.message.id);
        assert!(alice_rx.try_recv().is_err());

        // Bob is joined on node B, which shared presence makes visible to A.
        assert_eq!(w.db.unread_notification_count(w.bob).unwrap(), 0);
        assert_eq!(w.db.unread_notification_count(w.carol).unwrap(), 1);

        node_a.delete_message(w.alice, view.message.id).await.unwrap();
        assert_eq!(
            bob_rx.recv().await,
            Some(ServerEvent::MessageDeleted { channel_id: general.id, message_id: view.message.id })
        );

        node_a
            .grant_permission(w.admin, general.id, w.bob, Access::NONE)
            .await
            .unwrap();
        assert!(matches!(bob_rx.recv().await, Some(ServerEvent::JoinError { .. })));
        assert!(!node_b.registry().is_joined(bob_conn, general.id));

        node_a.close(alice_conn).await;
        assert_eq!(bus.topic_count(), 0);
    }

    fn shared_router(w: &World, node_id: Uuid) -> BroadcastRouter {
        BroadcastRouter::new(node_id, w.db.clone(), Arc::new(NoopBus::default()), PresenceMode::Shared)
    }

    fn present(w: &World, channel_id: Uuid) -> std::collections::HashSet<Uuid> {
        w.db.presence_users_in(channel_id, crate::presence::PRESENCE_TTL).unwrap()
    }

    #[tokio::test]
    async fn crashed_node_stops_suppressing_notifications() {
        let w = World::new();
        let general = w.channel("general", false);

        let crashed_id = Uuid::new_v4();
        let crashed = shared_router(&w, crashed_id);
        let (carol_conn, _carol_rx) = crashed.connect(w.carol);
        crashed.join(carol_conn, general.id).await.unwrap();
        assert!(present(&w, general.id).contains(&w.carol));

        // The process dies without closing anything and stops beating.
        w.db.with_conn(|c| {
            c.execute("UPDATE presence_nodes SET last_seen = 0 WHERE node_id = ?1", [crashed_id.to_string()])
                .map_err(anyhow::Error::from)
        })
        .unwrap();

        // Restarted under a fresh id, so clearing its own rows finds nothing.
        let restarted = shared_router(&w, Uuid::new_v4());
        assert_eq!(w.db.presence_clear_node(Uuid::new_v4()).unwrap(), 0);

        restarted.publish(w.admin, general.id, "anyone there?".into(), None).await.unwrap();
        assert_eq!(w.db.unread_notification_count(w.carol).unwrap(), 1);

        assert_eq!(restarted.inner.presence.heartbeat().unwrap(), 1);
        assert!(present(&w, general.id).is_empty());
    }

    #[tokio::test]
    async fn presence_write_after_close_leaves_no_row() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = shared_router(&w, Uuid::new_v4());
        let (conn, _rx) = router.connect(w.bob);
        router.join(conn, general.id).await.unwrap();
        assert!(present(&w, general.id).contains(&w.bob));

        router.close(conn).await;
        // A join write that was still in flight when the socket went away.
        router.inner.sync_presence(conn, general.id).await.unwrap().unwrap();
        assert!(present(&w, general.id).is_empty());
    }

    #[tokio::test]
    async fn late_eviction_write_does_not_undo_a_rejoin() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = shared_router(&w, Uuid::new_v4());
        let (conn, _rx) = router.connect(w.bob);
        router.join(conn, general.id).await.unwrap();

        router.grant_permission(w.admin, general.id, w.bob, Access::NONE).await.unwrap();
        router.grant_permission(w.admin, general.id, w.bob, Access::FULL).await.unwrap();
        router.join(conn, general.id).await.unwrap();

        // The eviction's presence write lands after the re-join.
        router.inner.sync_presence(conn, general.id).await.unwrap().unwrap();
        assert!(present(&w, general.id).contains(&w.bob));
    }

    #[tokio::test]
    async fn making_a_channel_private_evicts_plain_members() {
        let w = World::new();
        let general = w.channel("general", false);
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let node_a = BroadcastRouter::new(Uuid::new_v4(), w.db.clone(), bus.clone(), PresenceMode::Local);
        let node_b = BroadcastRouter::new(Uuid::new_v4(), w.db.clone(), bus.clone(), PresenceMode::Local);

        let (admin_conn, mut admin_rx) = node_a.connect(w.admin);
        let (bob_conn, mut bob_rx) = node_a.connect(w.bob);
        let (carol_conn, mut carol_rx) = node_b.connect(w.carol);
        node_a.join(admin_conn, general.id).await.unwrap();
        node_a.join(bob_conn, general.id).await.unwrap();
        node_b.join(carol_conn, general.id).await.unwrap();

        let update = UpdateChannelRequest {
            name: None,
            description: None,
            is_private: Some(true),
        };
        let channel = node_a.update_channel(w.admin, general.id, update).await.unwrap();
        assert!(channel.is_private);

        let denied = Some(ServerEvent::JoinError {
            channel_id: general.id,
            reason: ErrorReason::PermissionDenied,
        });
        assert_eq!(bob_rx.recv().await, denied);
        assert_eq!(carol_rx.recv().await, denied);
        assert!(!node_a.registry().is_joined(bob_conn, general.id));
        assert!(!node_b.registry().is_joined(carol_conn, general.id));
        // Admins still see private channels by default.
        assert!(node_a.registry().is_joined(admin_conn, general.id));

        node_a.publish(w.admin, general.id, "leads only".into(), None).await.unwrap();
        assert_eq!(created(admin_rx.recv().await).message.content, "leads only");
        assert!(bob_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn renaming_keeps_the_room() {
        let w = World::new();
        let general = w.channel("general", false);
        let router = w.router();
        let (conn, mut rx) = router.connect(w.bob);
        router.join(conn, general.id).await.unwrap();

        let update = UpdateChannelRequest {
            name: Some("lobby".into()),
            description: None,
            is_private: None,
        };
        assert_eq!(router.update_channel(w.admin, general.id, update).await.unwrap().name, "lobby");
        assert!(router.registry().is_joined(conn, general.id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn presence_mode_parses() {
        assert_eq!("shared".parse::<PresenceMode>().unwrap(), PresenceMode::Shared);
        assert!("sticky".parse::<PresenceMode>().is_err());
    }
}
