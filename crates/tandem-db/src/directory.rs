//! Channel Directory: channel metadata and explicit permission rows.
//!
//! Rows here are only changed by `create_channel`, `update_channel` and
//! `grant_permission`. Messaging reads them but never writes them (apart
//! from the `message_count` counter, which the store owns).

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use tandem_types::api::{ChannelListEntry, UpdateChannelRequest};
use tandem_types::error::ChatError;
use tandem_types::models::{Channel, ChannelPermission, ProjectRole};
use tandem_types::permissions::{Access, PermissionEvaluator, Subject};

use crate::models::{CHANNEL_COLUMNS, channel_from_row, format_ts, permission_from_row};
use crate::projects::{ensure_project, query_members, query_role};
use crate::{Database, StorageExt};

const MAX_CHANNEL_NAME_LEN: usize = 80;
const MAX_DESCRIPTION_LEN: usize = 1000;

impl Database {
    pub fn create_channel(
        &self,
        project_id: Uuid,
        creator: Uuid,
        name: &str,
        description: Option<&str>,
        is_private: bool,
    ) -> Result<Channel, ChatError> {
        let name = validate_channel_name(name)?;
        let description = validate_description(description)?;

        self.with_tx(|tx| {
            ensure_project(tx, project_id)?;
            if query_role(tx, project_id, creator)?.is_none() {
                return Err(ChatError::denied("only project members can create channels"));
            }

            let channel = Channel {
                id: Uuid::new_v4(),
                project_id,
                name,
                description,
                is_private,
                message_count: 0,
                created_by: creator,
                created_at: Utc::now(),
            };

            tx.execute(
                "INSERT INTO channels (id, project_id, name, description, is_private, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    channel.id.to_string(),
                    project_id.to_string(),
                    channel.name,
                    channel.description,
                    channel.is_private,
                    creator.to_string(),
                    format_ts(channel.created_at),
                ],
            )
            .map_err(|e| name_conflict(e, &channel.name))?;

            info!(
                "Channel #{} ({}) created in project {} (private={})",
                channel.name, channel.id, project_id, is_private
            );
            Ok(channel)
        })
    }

    pub fn get_channel(&self, channel_id: Uuid) -> Result<Channel, ChatError> {
        self.with_conn(|conn| query_channel(conn, channel_id))
    }

    /// The channel plus what `user_id` may do in it.
    pub fn channel_access(&self, channel_id: Uuid, user_id: Uuid) -> Result<(Channel, Access), ChatError> {
        self.with_conn(|conn| {
            let channel = query_channel(conn, channel_id)?;
            let access = resolve_access(conn, &self.evaluator, &channel, user_id)?;
            Ok((channel, access))
        })
    }

    /// Channels of a project that `user_id` can view, with their resolved
    /// access. Channels the caller cannot view are omitted entirely.
    pub fn list_channels(&self, project_id: Uuid, user_id: Uuid) -> Result<Vec<ChannelListEntry>, ChatError> {
        self.with_conn(|conn| {
            ensure_project(conn, project_id)?;
            let role = query_role(conn, project_id, user_id)?;
            if role.is_none() {
                return Ok(vec![]);
            }
            let subject = Subject { user_id, role };

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM channels WHERE project_id = ?1 ORDER BY name",
                    CHANNEL_COLUMNS
                ))
                .storage()?;
            let channels = stmt
                .query_map([project_id.to_string()], channel_from_row)
                .storage()?
                .collect::<rusqlite::Result<Vec<_>>>()
                .storage()?;

            let mut entries = Vec::with_capacity(channels.len());
            for channel in channels {
                let explicit = query_permission(conn, channel.id, user_id)?;
                let access = self.evaluator.resolve(&subject, &channel, explicit.as_ref());
                if access.can_view {
                    entries.push(ChannelListEntry { channel, access });
                }
            }
            Ok(entries)
        })
    }

    /// Rename, re-describe or change visibility. Project admins and the
    /// channel creator may do this. Messages reference the channel by id, so
    /// a rename does not touch history.
    pub fn update_channel(
        &self,
        channel_id: Uuid,
        actor: Uuid,
        update: &UpdateChannelRequest,
    ) -> Result<Channel, ChatError> {
        let name = update.name.as_deref().map(validate_channel_name).transpose()?;
        let description = match update.description.as_deref() {
            Some(d) => Some(validate_description(Some(d))?),
            None => None,
        };

        self.with_tx(|tx| {
            let mut channel = query_channel(tx, channel_id)?;
            let role = query_role(tx, channel.project_id, actor)?;
            if role != Some(ProjectRole::Admin) && channel.created_by != actor {
                return Err(ChatError::denied("only admins or the creator can edit a channel"));
            }

            if let Some(name) = name {
                channel.name = name;
            }
            if let Some(description) = description {
                channel.description = description;
            }
            if let Some(is_private) = update.is_private {
                channel.is_private = is_private;
            }

            tx.execute(
                "UPDATE channels SET name = ?2, description = ?3, is_private = ?4 WHERE id = ?1",
                rusqlite::params![
                    channel_id.to_string(),
                    channel.name,
                    channel.description,
                    channel.is_private,
                ],
            )
            .map_err(|e| name_conflict(e, &channel.name))?;

            Ok(channel)
        })
    }

    /// Create or replace the explicit row for `(channel, user)`. Requires the
    /// actor to be a project admin; the target must be a project member.
    pub fn grant_permission(
        &self,
        channel_id: Uuid,
        actor: Uuid,
        user_id: Uuid,
        can_view: bool,
        can_post: bool,
    ) -> Result<ChannelPermission, ChatError> {
        self.with_tx(|tx| {
            let channel = query_channel(tx, channel_id)?;
            if query_role(tx, channel.project_id, actor)? != Some(ProjectRole::Admin) {
                return Err(ChatError::denied("only project admins can change channel permissions"));
            }
            if query_role(tx, channel.project_id, user_id)?.is_none() {
                return Err(ChatError::NotFound("project member"));
            }

            tx.execute(
                "INSERT INTO channel_permissions (channel_id, user_id, can_view, can_post)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(channel_id, user_id) DO UPDATE SET
                    can_view = excluded.can_view,
                    can_post = excluded.can_post",
                rusqlite::params![channel_id.to_string(), user_id.to_string(), can_view, can_post],
            )
            .storage()?;

            info!(
                "Permission on #{} for {} set to view={} post={} by {}",
                channel.name, user_id, can_view, can_post, actor
            );
            Ok(ChannelPermission { channel_id, user_id, can_view, can_post })
        })
    }

    /// Project members who can view the channel.
    pub fn channel_viewers(&self, channel_id: Uuid) -> Result<(Channel, Vec<Uuid>), ChatError> {
        self.with_conn(|conn| {
            let channel = query_channel(conn, channel_id)?;
            let members = query_members(conn, channel.project_id)?;

            let mut viewers = Vec::with_capacity(members.len());
            for (user_id, role) in members {
                let subject = Subject { user_id, role: Some(role) };
                let explicit = query_permission(conn, channel_id, user_id)?;
                if self.evaluator.can_view(&subject, &channel, explicit.as_ref()) {
                    viewers.push(user_id);
                }
            }
            Ok((channel, viewers))
        })
    }
}

pub(crate) fn query_channel(conn: &Connection, channel_id: Uuid) -> Result<Channel, ChatError> {
    conn.query_row(
        &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS),
        [channel_id.to_string()],
        channel_from_row,
    )
    .optional()
    .storage()?
    .ok_or(ChatError::NotFound("channel"))
}

pub(crate) fn query_permission(
    conn: &Connection,
    channel_id: Uuid,
    user_id: Uuid,
) -> Result<Option<ChannelPermission>, ChatError> {
    conn.query_row(
        "SELECT channel_id, user_id, can_view, can_post FROM channel_permissions
         WHERE channel_id = ?1 AND user_id = ?2",
        [channel_id.to_string(), user_id.to_string()],
        permission_from_row,
    )
    .optional()
    .storage()
}

/// Membership lookup plus at most one permission-row lookup.
pub(crate) fn resolve_access(
    conn: &Connection,
    evaluator: &PermissionEvaluator,
    channel: &Channel,
    user_id: Uuid,
) -> Result<Access, ChatError> {
    let role = query_role(conn, channel.project_id, user_id)?;
    if role.is_none() {
        return Ok(Access::NONE);
    }
    let explicit = query_permission(conn, channel.id, user_id)?;
    Ok(evaluator.resolve(&Subject { user_id, role }, channel, explicit.as_ref()))
}

fn validate_channel_name(name: &str) -> Result<String, ChatError> {
    let name = name.trim().trim_start_matches('#');
    if name.is_empty() {
        return Err(ChatError::invalid("channel name is empty"));
    }
    if name.chars().count() > MAX_CHANNEL_NAME_LEN {
        return Err(ChatError::invalid(format!(
            "channel name exceeds {} characters",
            MAX_CHANNEL_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(ChatError::invalid("channel name contains control characters"));
    }
    Ok(name.to_string())
}

fn validate_description(description: Option<&str>) -> Result<Option<String>, ChatError> {
    let Some(d) = description.map(str::trim) else {
        return Ok(None);
    };
    if d.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ChatError::invalid(format!(
            "description exceeds {} characters",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok((!d.is_empty()).then(|| d.to_string()))
}

fn name_conflict(err: rusqlite::Error, name: &str) -> ChatError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            ChatError::Conflict(format!("a channel named '{}' already exists", name))
        }
        other => ChatError::Storage(other.into()),
    }
}
