//! Message Store Adapter: append-only message persistence with a bounded
//! recent-window read.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use tandem_types::error::ChatError;
use tandem_types::models::{Message, MessageView};

use crate::directory::{query_channel, resolve_access};
use crate::models::{format_ts, message_view_from_row, parse_ts, uuid_col};
use crate::{Database, StorageExt};

const MAX_CLIENT_TOKEN_LEN: usize = 64;

const MESSAGE_VIEW_SELECT: &str =
    "SELECT m.id, m.channel_id, m.user_id, m.content, m.client_token, m.created_at, u.name, u.avatar_url
     FROM messages m
     LEFT JOIN users u ON m.user_id = u.id";

impl Database {
    /// Persist a message and bump the channel's `message_count` in the same
    /// transaction.
    ///
    /// Post rights are re-checked here against the current rows rather than
    /// trusted from the caller: they may have changed since the client last
    /// rendered its composer.
    pub fn append(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
        content: &str,
        client_token: Option<&str>,
    ) -> Result<MessageView, ChatError> {
        self.validate_content(content)?;
        if client_token.is_some_and(|t| t.len() > MAX_CLIENT_TOKEN_LEN) {
            return Err(ChatError::invalid("client token too long"));
        }

        self.with_tx(|tx| {
            let channel = query_channel(tx, channel_id)?;
            let access = resolve_access(tx, &self.evaluator, &channel, user_id)?;
            if !access.can_post {
                return Err(ChatError::denied(format!("cannot post in #{}", channel.name)));
            }

            let created_at = next_timestamp(tx, channel_id)?;
            tx.execute(
                "INSERT INTO messages (channel_id, user_id, content, client_token, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    channel_id.to_string(),
                    user_id.to_string(),
                    content,
                    client_token,
                    format_ts(created_at),
                ],
            )
            .storage()?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE channels SET message_count = message_count + 1 WHERE id = ?1",
                [channel_id.to_string()],
            )
            .storage()?;

            query_message_view(tx, id)?.ok_or(ChatError::NotFound("message"))
        })
    }

    /// The newest `limit` messages of a channel, returned oldest-first.
    /// Requires view rights. `limit` is clamped to `1..=recent_cap`.
    pub fn recent(&self, channel_id: Uuid, viewer: Uuid, limit: u32) -> Result<Vec<MessageView>, ChatError> {
        let limit = limit.clamp(1, self.limits.recent_cap);

        self.with_conn(|conn| {
            let channel = query_channel(conn, channel_id)?;
            if !resolve_access(conn, &self.evaluator, &channel, viewer)?.can_view {
                return Err(ChatError::denied(format!("cannot view #{}", channel.name)));
            }

            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE m.channel_id = ?1 ORDER BY m.created_at DESC, m.id DESC LIMIT ?2",
                    MESSAGE_VIEW_SELECT
                ))
                .storage()?;
            let mut rows = stmt
                .query_map(rusqlite::params![channel_id.to_string(), limit], message_view_from_row)
                .storage()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .storage()?;

            rows.reverse();
            Ok(rows)
        })
    }

    /// Author-initiated delete. Decrements `message_count` in the same
    /// transaction; this is the only path that lowers the counter.
    pub fn delete_message(&self, message_id: i64, user_id: Uuid) -> Result<Message, ChatError> {
        self.with_tx(|tx| {
            let message = query_message_view(tx, message_id)?
                .ok_or(ChatError::NotFound("message"))?
                .message;
            if message.user_id != user_id {
                return Err(ChatError::denied("only the author can delete a message"));
            }

            tx.execute("DELETE FROM messages WHERE id = ?1", [message_id]).storage()?;
            tx.execute(
                "UPDATE channels SET message_count = MAX(message_count - 1, 0) WHERE id = ?1",
                [message.channel_id.to_string()],
            )
            .storage()?;

            Ok(message)
        })
    }

    pub fn message_channel(&self, message_id: i64) -> Result<Uuid, ChatError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT channel_id FROM messages WHERE id = ?1",
                [message_id],
                |row| uuid_col(row, 0),
            )
            .optional()
            .storage()?
            .ok_or(ChatError::NotFound("message"))
        })
    }

    fn validate_content(&self, content: &str) -> Result<(), ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::invalid("message is empty"));
        }
        if content.chars().count() > self.limits.max_message_len {
            return Err(ChatError::invalid(format!(
                "message exceeds {} characters",
                self.limits.max_message_len
            )));
        }
        Ok(())
    }
}

/// Wall-clock time, but never earlier than the channel's newest message so
/// that `(created_at, id)` keeps following commit order if the clock steps
/// backwards.
fn next_timestamp(conn: &Connection, channel_id: Uuid) -> Result<DateTime<Utc>, ChatError> {
    let now = Utc::now();
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM messages WHERE channel_id = ?1",
            [channel_id.to_string()],
            |row| row.get(0),
        )
        .storage()?;

    Ok(match last.as_deref().and_then(parse_ts) {
        Some(last) if last > now => last,
        _ => now,
    })
}

fn query_message_view(conn: &Connection, message_id: i64) -> Result<Option<MessageView>, ChatError> {
    conn.query_row(
        &format!("{} WHERE m.id = ?1", MESSAGE_VIEW_SELECT),
        [message_id],
        message_view_from_row,
    )
    .optional()
    .storage()
}
