//! Row mapping. Ids are stored as TEXT, timestamps as RFC 3339 TEXT with
//! millisecond precision so that lexical order equals time order.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use uuid::Uuid;

use tandem_types::models::{
    AuthorSummary, Channel, ChannelPermission, Message, MessageView, Notification, Project,
};

pub const CHANNEL_COLUMNS: &str =
    "id, project_id, name, description, is_private, message_count, created_by, created_at";

pub const NOTIFICATION_COLUMNS: &str =
    "id, user_id, type, title, message, resource_type, resource_id, is_read, created_at";

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>().ok().or_else(|| {
        // Rows written by SQLite's datetime('now') have no timezone.
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|ndt| ndt.and_utc())
    })
}

pub fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("bad timestamp '{}'", raw).into(),
        )
    })
}

pub fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        created_at: ts_col(row, 2)?,
    })
}

/// Expects `CHANNEL_COLUMNS` order.
pub fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: uuid_col(row, 0)?,
        project_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_private: row.get(4)?,
        message_count: row.get(5)?,
        created_by: uuid_col(row, 6)?,
        created_at: ts_col(row, 7)?,
    })
}

pub fn permission_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelPermission> {
    Ok(ChannelPermission {
        channel_id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        can_view: row.get(2)?,
        can_post: row.get(3)?,
    })
}

/// Expects `m.id, m.channel_id, m.user_id, m.content, m.client_token,
/// m.created_at, u.name, u.avatar_url`.
pub fn message_view_from_row(row: &Row<'_>) -> rusqlite::Result<MessageView> {
    let user_id = uuid_col(row, 2)?;
    Ok(MessageView {
        message: Message {
            id: row.get(0)?,
            channel_id: uuid_col(row, 1)?,
            user_id,
            content: row.get(3)?,
            client_token: row.get(4)?,
            created_at: ts_col(row, 5)?,
        },
        author: AuthorSummary {
            id: user_id,
            name: row
                .get::<_, Option<String>>(6)?
                .unwrap_or_else(|| "unknown".to_string()),
            avatar_url: row.get(7)?,
        },
    })
}

/// Expects `NOTIFICATION_COLUMNS` order.
pub fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: uuid_col(row, 1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        message: row.get(4)?,
        resource_type: row.get(5)?,
        resource_id: row.get(6)?,
        is_read: row.get(7)?,
        created_at: ts_col(row, 8)?,
    })
}
