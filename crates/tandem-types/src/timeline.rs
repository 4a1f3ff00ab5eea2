//! Client-side view of one channel.
//!
//! Sending is a two-phase protocol: `compose` renders a pending entry tagged
//! with a fresh correlation token, then either the authoritative
//! `message_created` echo carrying the same token replaces it, or a
//! `send_error` with the token marks it failed. Confirmed messages are keyed
//! by store id, so duplicate deliveries (bus replays, reconnect backfill) are
//! absorbed and the order is always `(created_at, id)` regardless of arrival
//! order. Deleted ids are remembered so a late duplicate of the original
//! `message_created` cannot bring a message back.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ErrorReason;
use crate::events::ServerEvent;
use crate::models::MessageView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Sending,
    Failed(ErrorReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub token: String,
    pub content: String,
    pub composed_at: DateTime<Utc>,
    pub state: PendingState,
}

#[derive(Debug)]
pub struct Timeline {
    channel_id: Uuid,
    confirmed: BTreeMap<(DateTime<Utc>, i64), MessageView>,
    index: HashMap<i64, (DateTime<Utc>, i64)>,
    deleted: HashSet<i64>,
    pending: Vec<PendingMessage>,
}

impl Timeline {
    pub fn new(channel_id: Uuid) -> Self {
        Self {
            channel_id,
            confirmed: BTreeMap::new(),
            index: HashMap::new(),
            deleted: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    /// Render a locally composed message. Returns the token to send along
    /// with `send_message`.
    pub fn compose(&mut self, content: impl Into<String>) -> String {
        let token = Uuid::new_v4().to_string();
        self.pending.push(PendingMessage {
            token: token.clone(),
            content: content.into(),
            composed_at: Utc::now(),
            state: PendingState::Sending,
        });
        token
    }

    /// Feed a gateway event. Returns true if the timeline changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::MessageCreated { message } => self.confirm(message.clone()),
            ServerEvent::MessageDeleted { channel_id, message_id } if *channel_id == self.channel_id => {
                self.deleted.insert(*message_id);
                match self.index.remove(message_id) {
                    Some(key) => self.confirmed.remove(&key).is_some(),
                    None => false,
                }
            }
            ServerEvent::SendError {
                channel_id,
                reason,
                client_token: Some(token),
                ..
            } if *channel_id == self.channel_id => self.fail(token, *reason),
            _ => false,
        }
    }

    /// Insert an authoritative copy, retiring the pending entry with the same
    /// token. Returns false for duplicates and other channels' messages.
    pub fn confirm(&mut self, view: MessageView) -> bool {
        if view.message.channel_id != self.channel_id {
            return false;
        }

        let retired = match view.message.client_token.as_deref() {
            Some(token) => self.retire(token),
            None => false,
        };

        let id = view.message.id;
        if self.index.contains_key(&id) || self.deleted.contains(&id) {
            return retired;
        }

        let key = view.message.ordering_key();
        self.index.insert(id, key);
        self.confirmed.insert(key, view);
        true
    }

    /// Merge a `recent()` window fetched after (re)connecting. Returns how
    /// many messages were new.
    pub fn backfill(&mut self, window: impl IntoIterator<Item = MessageView>) -> usize {
        let mut added = 0;
        for view in window {
            let id = view.message.id;
            let fresh = !self.index.contains_key(&id) && !self.deleted.contains(&id);
            if self.confirm(view) && fresh {
                added += 1;
            }
        }
        added
    }

    pub fn fail(&mut self, token: &str, reason: ErrorReason) -> bool {
        match self.pending.iter_mut().find(|p| p.token == token) {
            Some(p) => {
                p.state = PendingState::Failed(reason);
                true
            }
            None => false,
        }
    }

    /// Drop a pending entry, typically after the user dismisses a failure.
    pub fn discard(&mut self, token: &str) -> Option<PendingMessage> {
        let pos = self.pending.iter().position(|p| p.token == token)?;
        Some(self.pending.remove(pos))
    }

    /// Confirmed messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &MessageView> {
        self.confirmed.values()
    }

    pub fn pending(&self) -> &[PendingMessage] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }

    fn retire(&mut self, token: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.token != token);
        self.pending.len() != before
    }
}
