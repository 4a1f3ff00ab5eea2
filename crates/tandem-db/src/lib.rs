pub mod directory;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod presence;
pub mod projects;
pub mod store;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use tandem_types::error::ChatError;
use tandem_types::permissions::{PermissionEvaluator, PrivateDefault};

/// Content and window limits enforced by the message store.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum message length in characters.
    pub max_message_len: usize,
    /// Upper bound for the `recent` window.
    pub recent_cap: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_len: 4000,
            recent_cap: 100,
        }
    }
}

pub struct Database {
    conn: Mutex<Connection>,
    evaluator: PermissionEvaluator,
    limits: Limits,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads (and for several processes sharing one file)
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let db = Self::from_connection(conn)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            evaluator: PermissionEvaluator::default(),
            limits: Limits::default(),
        })
    }

    pub fn with_private_default(mut self, policy: PrivateDefault) -> Self {
        self.evaluator = PermissionEvaluator::new(policy);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_conn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<anyhow::Error>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a transaction. Any error rolls the whole unit back.
    ///
    /// The write lock is taken up front (`BEGIN IMMEDIATE`): a deferred
    /// transaction that reads and then writes cannot wait out another
    /// process's writer and fails with SQLITE_BUSY instead.
    pub fn with_tx<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<anyhow::Error>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(anyhow::Error::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(out)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("DB lock poisoned: {}", e))
    }
}

/// Lifts rusqlite results into the domain error type.
pub(crate) trait StorageExt<T> {
    fn storage(self) -> Result<T, ChatError>;
}

impl<T> StorageExt<T> for rusqlite::Result<T> {
    fn storage(self) -> Result<T, ChatError> {
        self.map_err(|e| ChatError::Storage(e.into()))
    }
}

/// Opens an in-memory database with the given users, one project where
/// `admin` is admin and everybody else a member. Test helper.
#[cfg(test)]
pub(crate) fn seeded(
    admin: uuid::Uuid,
    members: &[uuid::Uuid],
) -> (Database, tandem_types::models::Project) {
    let db = Database::open_in_memory().unwrap();
    db.upsert_user(admin, "admin", None).unwrap();
    let project = db.create_project("Apollo", admin).unwrap();
    for (i, m) in members.iter().enumerate() {
        db.upsert_user(*m, &format!("user{}", i), None).unwrap();
        db.upsert_member(
            project.id,
            admin,
            *m,
            tandem_types::models::ProjectRole::Member,
        )
        .unwrap();
    }
    (db, project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    /// Removes the database file and its WAL side files on drop.
    struct TempDb(std::path::PathBuf);

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    #[test]
    fn two_handles_on_one_file_can_append_concurrently() {
        let file = TempDb(std::env::temp_dir().join(format!("tandem-{}.db", Uuid::new_v4())));
        let first = Arc::new(Database::open(&file.0).unwrap());
        let second = Arc::new(Database::open(&file.0).unwrap());

        let admin = Uuid::new_v4();
        first.upsert_user(admin, "admin", None).unwrap();
        let project = first.create_project("Apollo", admin).unwrap();
        let channel = first
            .create_channel(project.id, admin, "general", None, false)
            .unwrap();

        let writers: Vec<_> = [first.clone(), second.clone()]
            .into_iter()
            .map(|db| {
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|i| db.append(channel.id, admin, &format!("m{}", i), None).is_err())
                        .count()
                })
            })
            .collect();
        let failures: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();

        assert_eq!(failures, 0);
        assert_eq!(second.get_channel(channel.id).unwrap().message_count, 200);

        let window = first.recent(channel.id, admin, 100).unwrap();
        assert!(
            window
                .windows(2)
                .all(|p| p[0].message.ordering_key() < p[1].message.ordering_key())
        );
    }
}
