//! Caller-side interface to the store actor.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use bazaar_core::{SessionId, SessionRecord};

use super::commands::{StoreCommand, StoreError};

/// Cheap-to-clone handle to the session store.
///
/// All methods message the actor on the persistence loop and suspend on
/// a oneshot; none of them block the calling loop.
#[derive(Clone)]
pub struct SessionStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl SessionStore {
    pub fn new(tx: mpsc::Sender<StoreCommand>) -> Self {
        Self { tx }
    }

    /// Whether a record exists for `id`.
    pub async fn exist(&self, id: SessionId) -> Result<bool, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Exist { id, respond_to: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Loads the record for `id`, if present.
    pub async fn load(&self, id: SessionId) -> Result<Option<SessionRecord>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Load { id, respond_to: tx })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Stores `record` under `id` with a fresh TTL. Last writer wins.
    pub async fn save(
        &self,
        id: SessionId,
        record: SessionRecord,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Save {
                id,
                record,
                ttl,
                respond_to: tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Pushes the expiry of `id` out by `ttl`.
    ///
    /// Returns `false` when no record exists.
    pub async fn update_lifetime(
        &self,
        id: SessionId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::UpdateLifetime {
                id,
                ttl,
                respond_to: tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Fire-and-forget expiry sweep, used by the scheduler task.
    pub async fn sweep(&self) {
        let _ = self.tx.send(StoreCommand::Sweep).await;
    }

    /// Whether the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreActor;

    fn spawn_test_store() -> SessionStore {
        let (tx, rx) = mpsc::channel(16);
        let actor = StoreActor::in_memory(rx).expect("open store");
        tokio::spawn(actor.run());
        SessionStore::new(tx)
    }

    #[tokio::test]
    async fn test_roundtrip_through_actor() {
        let store = spawn_test_store();
        let id = SessionId::new("h1");
        let record = SessionRecord {
            user: Some(bazaar_core::UserId(7)),
            verify_phone: Some("15550002222".into()),
            verify_token: None,
        };

        store
            .save(id.clone(), record.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.exist(id.clone()).await.unwrap());
        assert_eq!(store.load(id).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_closed_actor_yields_closed_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let store = SessionStore::new(tx);

        let err = store.exist(SessionId::new("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        assert!(!store.is_connected());
    }

    #[tokio::test]
    async fn test_sweep_ignores_closed_actor() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let store = SessionStore::new(tx);
        // Must not panic or error
        store.sweep().await;
    }
}
