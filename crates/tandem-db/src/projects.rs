use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use tandem_types::error::ChatError;
use tandem_types::models::{Project, ProjectRole};

use crate::models::{format_ts, project_from_row};
use crate::{Database, StorageExt};

const MAX_PROJECT_NAME_LEN: usize = 120;

impl Database {
    // -- Users --

    /// Record the display fields of an authenticated identity.
    pub fn upsert_user(
        &self,
        id: Uuid,
        name: &str,
        avatar_url: Option<&str>,
    ) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, avatar_url, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    avatar_url = excluded.avatar_url,
                    updated_at = excluded.updated_at",
                rusqlite::params![id.to_string(), name, avatar_url, format_ts(Utc::now())],
            )
            .storage()?;
            Ok(())
        })
    }

    // -- Projects --

    /// Create a project; the creator becomes its first admin.
    pub fn create_project(&self, name: &str, creator: Uuid) -> Result<Project, ChatError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_PROJECT_NAME_LEN {
            return Err(ChatError::invalid("project name must be 1-120 characters"));
        }

        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![project.id.to_string(), project.name, format_ts(project.created_at)],
            )
            .storage()?;
            tx.execute(
                "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, 'admin')",
                rusqlite::params![project.id.to_string(), creator.to_string()],
            )
            .storage()?;
            Ok(project)
        })
    }

    pub fn get_project(&self, id: Uuid) -> Result<Project, ChatError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                [id.to_string()],
                project_from_row,
            )
            .optional()
            .storage()?
            .ok_or(ChatError::NotFound("project"))
        })
    }

    /// Add a member or change their role. Only project admins may do this.
    pub fn upsert_member(
        &self,
        project_id: Uuid,
        actor: Uuid,
        user_id: Uuid,
        role: ProjectRole,
    ) -> Result<(), ChatError> {
        self.with_tx(|tx| {
            ensure_project(tx, project_id)?;
            if query_role(tx, project_id, actor)? != Some(ProjectRole::Admin) {
                return Err(ChatError::denied("only project admins can manage members"));
            }
            tx.execute(
                "INSERT INTO project_members (project_id, user_id, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id, user_id) DO UPDATE SET role = excluded.role",
                rusqlite::params![project_id.to_string(), user_id.to_string(), role.as_str()],
            )
            .storage()?;
            Ok(())
        })
    }

    pub fn role_of(&self, project_id: Uuid, user_id: Uuid) -> Result<Option<ProjectRole>, ChatError> {
        self.with_conn(|conn| query_role(conn, project_id, user_id))
    }
}

pub(crate) fn ensure_project(conn: &Connection, project_id: Uuid) -> Result<(), ChatError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM projects WHERE id = ?1",
            [project_id.to_string()],
            |_| Ok(()),
        )
        .optional()
        .storage()?;
    exists.ok_or(ChatError::NotFound("project"))
}

pub(crate) fn query_role(
    conn: &Connection,
    project_id: Uuid,
    user_id: Uuid,
) -> Result<Option<ProjectRole>, ChatError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT role FROM project_members WHERE project_id = ?1 AND user_id = ?2",
            [project_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .storage()?;

    raw.map(|r| {
        r.parse::<ProjectRole>()
            .map_err(|e| ChatError::Storage(anyhow::anyhow!(e)))
    })
    .transpose()
}

/// Every member of the project with their role.
pub(crate) fn query_members(
    conn: &Connection,
    project_id: Uuid,
) -> Result<Vec<(Uuid, ProjectRole)>, ChatError> {
    let mut stmt = conn
        .prepare("SELECT user_id, role FROM project_members WHERE project_id = ?1")
        .storage()?;
    let rows = stmt
        .query_map([project_id.to_string()], |row| {
            Ok((crate::models::uuid_col(row, 0)?, row.get::<_, String>(1)?))
        })
        .storage()?
        .collect::<rusqlite::Result<Vec<_>>>()
        .storage()?;

    rows.into_iter()
        .map(|(id, role)| {
            role.parse::<ProjectRole>()
                .map(|r| (id, r))
                .map_err(|e| ChatError::Storage(anyhow::anyhow!(e)))
        })
        .collect()
}
