use std::sync::Arc;

use tracing::debug;

use tandem_db::Database;
use tandem_types::error::ChatError;
use tandem_types::models::{
    MessageView, NOTIFICATION_KIND_CHANNEL_MESSAGE, NewNotification, RESOURCE_TYPE_CHANNEL,
};

use crate::presence::PresenceTracker;

const PREVIEW_CHARS: usize = 140;

/// Creates notification rows for channel activity a user did not see live.
#[derive(Clone)]
pub struct NotificationFanout {
    db: Arc<Database>,
    presence: Arc<dyn PresenceTracker>,
}

impl NotificationFanout {
    pub fn new(db: Arc<Database>, presence: Arc<dyn PresenceTracker>) -> Self {
        Self { db, presence }
    }

    /// One notification per viewer of the channel, except the author and
    /// anyone currently joined to the room. Blocking; returns how many rows
    /// were created.
    pub fn notify(&self, view: &MessageView) -> Result<usize, ChatError> {
        let channel_id = view.message.channel_id;
        let (channel, viewers) = self.db.channel_viewers(channel_id)?;
        let present = self.presence.users_in(channel_id)?;

        let title = format!("New message in #{}", channel.name);
        let body = format!("{}: {}", view.author.name, preview(&view.message.content));

        let batch: Vec<NewNotification> = viewers
            .into_iter()
            .filter(|user_id| *user_id != view.message.user_id && !present.contains(user_id))
            .map(|user_id| NewNotification {
                user_id,
                kind: NOTIFICATION_KIND_CHANNEL_MESSAGE.to_string(),
                title: title.clone(),
                message: body.clone(),
                resource_type: Some(RESOURCE_TYPE_CHANNEL.to_string()),
                resource_id: Some(channel_id.to_string()),
            })
            .collect();

        let created = self.db.insert_notifications(&batch)?.len();
        debug!(
            "Message {} in #{}: {} notified, {} present",
            view.message.id,
            channel.name,
            created,
            present.len()
        );
        Ok(created)
    }
}

fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let mut out: String = flat.chars().take(PREVIEW_CHARS - 1).collect();
    out.push('…');
    out
}
