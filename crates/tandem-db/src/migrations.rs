use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                avatar_url  TEXT,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE projects (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE project_members (
                project_id  TEXT NOT NULL REFERENCES projects(id),
                user_id     TEXT NOT NULL,
                role        TEXT NOT NULL CHECK (role IN ('member', 'admin')),
                PRIMARY KEY (project_id, user_id)
            );

            -- Names compare case-insensitively, so the UNIQUE constraint does too.
            CREATE TABLE channels (
                id              TEXT PRIMARY KEY,
                project_id      TEXT NOT NULL REFERENCES projects(id),
                name            TEXT NOT NULL COLLATE NOCASE,
                description     TEXT,
                is_private      INTEGER NOT NULL DEFAULT 0,
                message_count   INTEGER NOT NULL DEFAULT 0 CHECK (message_count >= 0),
                created_by      TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                UNIQUE (project_id, name)
            );

            CREATE TABLE channel_permissions (
                channel_id  TEXT NOT NULL REFERENCES channels(id),
                user_id     TEXT NOT NULL,
                can_view    INTEGER NOT NULL,
                can_post    INTEGER NOT NULL,
                PRIMARY KEY (channel_id, user_id)
            );

            -- AUTOINCREMENT: ids are never reused, so they follow commit order.
            CREATE TABLE messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                channel_id      TEXT NOT NULL REFERENCES channels(id),
                user_id         TEXT NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL,
                client_token    TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_channel
                ON messages(channel_id, created_at, id);

            CREATE TABLE notifications (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         TEXT NOT NULL,
                type            TEXT NOT NULL,
                title           TEXT NOT NULL,
                message         TEXT NOT NULL,
                resource_type   TEXT,
                resource_id     TEXT,
                is_read         INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_user
                ON notifications(user_id, created_at);

            CREATE TABLE room_presence (
                node_id         TEXT NOT NULL,
                connection_id   TEXT NOT NULL,
                user_id         TEXT NOT NULL,
                channel_id      TEXT NOT NULL,
                joined_at       TEXT NOT NULL,
                PRIMARY KEY (connection_id, channel_id)
            );

            CREATE INDEX idx_room_presence_channel
                ON room_presence(channel_id, user_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (presence node liveness)");
        conn.execute_batch(
            "
            -- Heartbeat per node, unix milliseconds. Presence rows of nodes
            -- that stopped beating are ignored and then expired.
            CREATE TABLE presence_nodes (
                node_id     TEXT PRIMARY KEY,
                last_seen   INTEGER NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
