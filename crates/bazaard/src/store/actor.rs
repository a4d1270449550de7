//! The store actor: owns the SQLite handle, runs on the persistence loop.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use bazaar_core::{SessionId, SessionRecord};

use super::commands::{StoreCommand, StoreError};

/// Owns the blocking database connection. Every call executes inline on
/// the persistence loop; isolation from the network loops is the whole
/// point of that reserved loop.
pub struct StoreActor {
    db: Connection,
    rx: mpsc::Receiver<StoreCommand>,
}

impl StoreActor {
    /// Opens (or creates) the database and prepares the schema.
    pub fn open(
        path: &Path,
        rx: mpsc::Receiver<StoreCommand>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::database)?;
            }
        }
        let db = Connection::open(path).map_err(StoreError::database)?;
        db.pragma_update(None, "journal_mode", "WAL")
            .map_err(StoreError::database)?;
        init_schema(&db)?;
        Ok(Self { db, rx })
    }

    /// An in-memory database for tests.
    pub fn in_memory(rx: mpsc::Receiver<StoreCommand>) -> Result<Self, StoreError> {
        let db = Connection::open_in_memory().map_err(StoreError::database)?;
        init_schema(&db)?;
        Ok(Self { db, rx })
    }

    /// Drains commands until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            self.handle(cmd);
        }
        debug!("store actor stopped");
    }

    fn handle(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::Exist { id, respond_to } => {
                let _ = respond_to.send(self.exist(&id));
            }
            StoreCommand::Load { id, respond_to } => {
                let _ = respond_to.send(self.load(&id));
            }
            StoreCommand::Save {
                id,
                record,
                ttl,
                respond_to,
            } => {
                let _ = respond_to.send(self.save(&id, &record, ttl));
            }
            StoreCommand::UpdateLifetime {
                id,
                ttl,
                respond_to,
            } => {
                let _ = respond_to.send(self.update_lifetime(&id, ttl));
            }
            StoreCommand::Sweep => {
                if let Err(e) = self.sweep() {
                    error!(error = %e, "session sweep failed");
                }
            }
        }
    }

    fn exist(&self, id: &SessionId) -> Result<bool, StoreError> {
        let found = self
            .db
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(StoreError::database)?;
        Ok(found.is_some())
    }

    fn load(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let raw: Option<String> = self
            .db
            .query_row(
                "SELECT record FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(StoreError::database)?;

        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    id: id.as_str().to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    fn save(
        &self,
        id: &SessionId,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let text = serde_json::to_string(record).map_err(StoreError::database)?;
        self.db
            .execute(
                "INSERT INTO sessions (id, record, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     record = excluded.record,
                     expires_at = excluded.expires_at",
                params![id.as_str(), text, expiry(ttl)],
            )
            .map_err(StoreError::database)?;
        Ok(())
    }

    fn update_lifetime(&self, id: &SessionId, ttl: Duration) -> Result<bool, StoreError> {
        let changed = self
            .db
            .execute(
                "UPDATE sessions SET expires_at = ?2 WHERE id = ?1",
                params![id.as_str(), expiry(ttl)],
            )
            .map_err(StoreError::database)?;
        Ok(changed > 0)
    }

    /// Deletes every expired record inside one write transaction.
    fn sweep(&mut self) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let tx = self.db.transaction().map_err(StoreError::database)?;
        let removed = tx
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])
            .map_err(StoreError::database)?;
        tx.commit().map_err(StoreError::database)?;
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        Ok(())
    }
}

fn init_schema(db: &Connection) -> Result<(), StoreError> {
    db.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
             id         TEXT PRIMARY KEY,
             record     TEXT NOT NULL,
             expires_at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_sessions_expires_at
             ON sessions (expires_at);",
    )
    .map_err(StoreError::database)
}

fn expiry(ttl: Duration) -> i64 {
    chrono::Utc::now().timestamp().saturating_add(ttl.as_secs() as i64)
}

impl Drop for StoreActor {
    fn drop(&mut self) {
        // WAL checkpoints on close; a failure here only costs a replay
        if let Err(e) = self.db.execute_batch("PRAGMA optimize;") {
            warn!(error = %e, "failed to optimize database on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_actor() -> StoreActor {
        let (_tx, rx) = mpsc::channel(4);
        StoreActor::in_memory(rx).expect("open in-memory store")
    }

    fn record(user: i64) -> SessionRecord {
        SessionRecord {
            user: Some(bazaar_core::UserId(user)),
            verify_phone: None,
            verify_token: None,
        }
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let actor = open_actor();
        let id = SessionId::new("s1");
        let rec = record(5);

        actor.save(&id, &rec, Duration::from_secs(60)).unwrap();
        let loaded = actor.load(&id).unwrap();
        assert_eq!(loaded, Some(rec));
    }

    #[test]
    fn test_exist_reflects_save() {
        let actor = open_actor();
        let id = SessionId::new("s2");
        assert!(!actor.exist(&id).unwrap());
        actor
            .save(&id, &SessionRecord::empty(), Duration::from_secs(60))
            .unwrap();
        assert!(actor.exist(&id).unwrap());
    }

    #[test]
    fn test_save_twice_last_writer_wins() {
        let actor = open_actor();
        let id = SessionId::new("s3");
        actor.save(&id, &record(1), Duration::from_secs(60)).unwrap();
        actor.save(&id, &record(2), Duration::from_secs(60)).unwrap();
        let loaded = actor.load(&id).unwrap().unwrap();
        assert_eq!(loaded.user, Some(bazaar_core::UserId(2)));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let mut actor = open_actor();
        let dead = SessionId::new("dead");
        let live = SessionId::new("live");
        actor.save(&dead, &record(1), Duration::from_secs(0)).unwrap();
        actor.save(&live, &record(2), Duration::from_secs(600)).unwrap();

        actor.sweep().unwrap();

        assert!(!actor.exist(&dead).unwrap());
        assert!(actor.exist(&live).unwrap());
    }

    #[test]
    fn test_update_lifetime_rescues_record_from_sweep() {
        let mut actor = open_actor();
        let id = SessionId::new("s4");
        actor.save(&id, &record(1), Duration::from_secs(0)).unwrap();
        assert!(actor.update_lifetime(&id, Duration::from_secs(600)).unwrap());

        actor.sweep().unwrap();
        assert!(actor.exist(&id).unwrap());
    }

    #[test]
    fn test_update_lifetime_missing_record() {
        let actor = open_actor();
        let id = SessionId::new("absent");
        assert!(!actor.update_lifetime(&id, Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let actor = open_actor();
        assert_eq!(actor.load(&SessionId::new("nope")).unwrap(), None);
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let actor = open_actor();
        actor
            .db
            .execute(
                "INSERT INTO sessions (id, record, expires_at) VALUES ('bad', 'not json', 9999999999)",
                [],
            )
            .unwrap();
        let err = actor.load(&SessionId::new("bad")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
