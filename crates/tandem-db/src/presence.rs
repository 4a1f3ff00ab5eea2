//! Room membership rows shared by every process using this database.
//! Backs the cross-process presence strategy.
//!
//! Each node keeps a heartbeat row in `presence_nodes`. A node that stops
//! beating (crash, kill -9, lost host) has its rows ignored once they are
//! older than the caller's TTL, and `presence_expire` deletes them.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

use tandem_types::error::ChatError;

use crate::models::{format_ts, uuid_col};
use crate::{Database, StorageExt};

impl Database {
    pub fn presence_join(
        &self,
        node_id: Uuid,
        connection_id: Uuid,
        user_id: Uuid,
        channel_id: Uuid,
    ) -> Result<(), ChatError> {
        self.with_tx(|tx| {
            touch_node(tx, node_id)?;
            tx.execute(
                "INSERT OR IGNORE INTO room_presence (node_id, connection_id, user_id, channel_id, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    node_id.to_string(),
                    connection_id.to_string(),
                    user_id.to_string(),
                    channel_id.to_string(),
                    format_ts(Utc::now()),
                ],
            )
            .storage()?;
            Ok(())
        })
    }

    pub fn presence_leave(&self, connection_id: Uuid, channel_id: Uuid) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM room_presence WHERE connection_id = ?1 AND channel_id = ?2",
                [connection_id.to_string(), channel_id.to_string()],
            )
            .storage()?;
            Ok(())
        })
    }

    pub fn presence_drop_connection(&self, connection_id: Uuid) -> Result<(), ChatError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM room_presence WHERE connection_id = ?1",
                [connection_id.to_string()],
            )
            .storage()?;
            Ok(())
        })
    }

    /// Forget everything a node recorded. Called at startup, since a
    /// restarted process holds no connections.
    pub fn presence_clear_node(&self, node_id: Uuid) -> Result<usize, ChatError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM room_presence WHERE node_id = ?1", [node_id.to_string()])
                .storage()
        })
    }

    /// Record that `node_id` is alive.
    pub fn presence_touch_node(&self, node_id: Uuid) -> Result<(), ChatError> {
        self.with_conn(|conn| touch_node(conn, node_id))
    }

    /// Delete presence rows of nodes silent for longer than `ttl`, and the
    /// heartbeat rows of those nodes. Returns how many presence rows went.
    pub fn presence_expire(&self, ttl: Duration) -> Result<usize, ChatError> {
        let cutoff = cutoff_millis(ttl);
        self.with_tx(|tx| {
            let expired = tx
                .execute(
                    "DELETE FROM room_presence WHERE node_id NOT IN
                        (SELECT node_id FROM presence_nodes WHERE last_seen >= ?1)",
                    [cutoff],
                )
                .storage()?;
            tx.execute("DELETE FROM presence_nodes WHERE last_seen < ?1", [cutoff])
                .storage()?;
            Ok(expired)
        })
    }

    /// Users with at least one connection joined to the channel, on any node
    /// that has beaten within `ttl`.
    pub fn presence_users_in(&self, channel_id: Uuid, ttl: Duration) -> Result<HashSet<Uuid>, ChatError> {
        let cutoff = cutoff_millis(ttl);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT p.user_id FROM room_presence p
                     JOIN presence_nodes n ON n.node_id = p.node_id
                     WHERE p.channel_id = ?1 AND n.last_seen >= ?2",
                )
                .storage()?;
            let users = stmt
                .query_map(rusqlite::params![channel_id.to_string(), cutoff], |row| uuid_col(row, 0))
                .storage()?
                .collect::<rusqlite::Result<HashSet<_>>>()
                .storage()?;
            Ok(users)
        })
    }
}

fn touch_node(conn: &Connection, node_id: Uuid) -> Result<(), ChatError> {
    conn.execute(
        "INSERT INTO presence_nodes (node_id, last_seen) VALUES (?1, ?2)
         ON CONFLICT(node_id) DO UPDATE SET last_seen = excluded.last_seen",
        rusqlite::params![node_id.to_string(), Utc::now().timestamp_millis()],
    )
    .storage()?;
    Ok(())
}

fn cutoff_millis(ttl: Duration) -> i64 {
    Utc::now().timestamp_millis() - i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn age_node(db: &Database, node: Uuid) {
        db.with_conn(|c| {
            c.execute("UPDATE presence_nodes SET last_seen = 0 WHERE node_id = ?1", [node.to_string()])
                .map_err(anyhow::Error::from)
        })
        .unwrap();
    }

    #[test]
    fn presence_rows_track_joins_across_nodes() {
        let db = Database::open_in_memory().unwrap();
        let (node_a, node_b) = (Uuid::new_v4(), Uuid::new_v4());
        let (conn_a, conn_b) = (Uuid::new_v4(), Uuid::new_v4());
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();

        db.presence_join(node_a, conn_a, user, channel).unwrap();
        db.presence_join(node_a, conn_a, user, channel).unwrap();
        db.presence_join(node_b, conn_b, user, channel).unwrap();
        assert!(db.presence_users_in(channel, TTL).unwrap().contains(&user));

        db.presence_leave(conn_a, channel).unwrap();
        assert!(db.presence_users_in(channel, TTL).unwrap().contains(&user));

        assert_eq!(db.presence_clear_node(node_b).unwrap(), 1);
        assert!(db.presence_users_in(channel, TTL).unwrap().is_empty());
    }

    #[test]
    fn dropping_a_connection_leaves_every_room() {
        let db = Database::open_in_memory().unwrap();
        let node = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let user = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        db.presence_join(node, conn, user, a).unwrap();
        db.presence_join(node, conn, user, b).unwrap();
        db.presence_drop_connection(conn).unwrap();
        assert!(db.presence_users_in(a, TTL).unwrap().is_empty());
        assert!(db.presence_users_in(b, TTL).unwrap().is_empty());
    }

    #[test]
    fn silent_nodes_stop_counting_and_expire() {
        let db = Database::open_in_memory().unwrap();
        let (dead, live) = (Uuid::new_v4(), Uuid::new_v4());
        let channel = Uuid::new_v4();
        let (carol, dave) = (Uuid::new_v4(), Uuid::new_v4());

        db.presence_join(dead, Uuid::new_v4(), carol, channel).unwrap();
        db.presence_join(live, Uuid::new_v4(), dave, channel).unwrap();
        age_node(&db, dead);

        let present = db.presence_users_in(channel, TTL).unwrap();
        assert!(!present.contains(&carol));
        assert!(present.contains(&dave));

        assert_eq!(db.presence_expire(TTL).unwrap(), 1);
        assert_eq!(db.presence_expire(TTL).unwrap(), 0);
        assert_eq!(db.presence_clear_node(dead).unwrap(), 0);
    }

    #[test]
    fn touching_keeps_a_node_alive() {
        let db = Database::open_in_memory().unwrap();
        let node = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let user = Uuid::new_v4();

        db.presence_join(node, Uuid::new_v4(), user, channel).unwrap();
        age_node(&db, node);
        assert!(db.presence_users_in(channel, TTL).unwrap().is_empty());

        db.presence_touch_node(node).unwrap();
        assert!(db.presence_users_in(channel, TTL).unwrap().contains(&user));
        assert_eq!(db.presence_expire(TTL).unwrap(), 0);
    }
}
