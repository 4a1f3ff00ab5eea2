use chrono::Utc;
use uuid::Uuid;

use tandem_types::error::ChatError;
use tandem_types::models::{NewNotification, Notification};

use crate::models::{NOTIFICATION_COLUMNS, format_ts, notification_from_row};
use crate::{Database, StorageExt};

/// Hard upper bound on one `list_notifications` page.
const MAX_LIST: u32 = 200;

impl Database {
    /// Insert a batch of notifications atomically.
    pub fn insert_notifications(&self, batch: &[NewNotification]) -> Result<Vec<Notification>, ChatError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let created_at = Utc::now();
        let stamp = format_ts(created_at);

        self.with_tx(|tx| {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO notifications (user_id, type, title, message, resource_type, resource_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .storage()?;

            let mut out = Vec::with_capacity(batch.len());
            for n in batch {
                stmt.execute(rusqlite::params![
                    n.user_id.to_string(),
                    n.kind,
                    n.title,
                    n.message,
                    n.resource_type,
                    n.resource_id,
                    stamp,
                ])
                .storage()?;
                out.push(Notification {
                    id: tx.last_insert_rowid(),
                    user_id: n.user_id,
                    kind: n.kind.clone(),
                    title: n.title.clone(),
                    message: n.message.clone(),
                    resource_type: n.resource_type.clone(),
                    resource_id: n.resource_id.clone(),
                    is_read: false,
                    created_at,
                });
            }
            Ok(out)
        })
    }

    /// Newest first.
    pub fn list_notifications(&self, user_id: Uuid, limit: u32) -> Result<Vec<Notification>, ChatError> {
        let limit = limit.clamp(1, MAX_LIST);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM notifications WHERE user_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2",
                    NOTIFICATION_COLUMNS
                ))
                .storage()?;
            let rows = stmt
                .query_map(rusqlite::params![user_id.to_string(), limit], notification_from_row)
                .storage()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .storage()?;
            Ok(rows)
        })
    }

    /// Flip `is_read`. A notification owned by someone else reads as
    /// not found.
    pub fn mark_notification_read(&self, notification_id: i64, user_id: Uuid) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                    rusqlite::params![notification_id, user_id.to_string()],
                )
                .storage()?;
            if changed == 0 {
                return Err(ChatError::NotFound("notification"));
            }
            Ok(())
        })
    }

    /// Returns how many notifications changed state.
    pub fn mark_all_notifications_read(&self, user_id: Uuid) -> Result<usize, ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
                [user_id.to_string()],
            )
            .storage()
        })
    }

    pub fn unread_notification_count(&self, user_id: Uuid) -> Result<i64, ChatError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND is_read = 0",
                [user_id.to_string()],
                |row| row.get(0),
            )
            .storage()
        })
    }
}
