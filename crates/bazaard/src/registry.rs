//! Concurrently-readable index over live, authenticated connections.
//!
//! Supports targeted push by connection id and broadcast to every open
//! connection of one account. Entries are non-owning (`Weak`): the
//! registry never extends a connection's lifetime, and removal is
//! synchronous with disconnect so no stale entry can be dereferenced.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::debug;

use bazaar_core::UserId;

use crate::connection::{ConnId, Connection};

#[derive(Default)]
struct Inner {
    /// conn id → (account, non-owning back-reference)
    by_conn: HashMap<ConnId, (UserId, Weak<Connection>)>,
    /// account → connection ids (one account may hold several devices)
    by_user: HashMap<UserId, HashSet<ConnId>>,
}

/// Registry of authenticated connections.
///
/// Readers take the shared lock, mutators the exclusive one; neither
/// sits on the per-message hot path. Pushes enqueue onto the target
/// connections' outbound queues only after the lock is released, so a
/// slow or full queue never blocks other registry operations.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under its authenticated account.
    ///
    /// Called on successful authentication. Re-inserting the same
    /// connection (e.g. after a sudo switch) replaces its account
    /// binding.
    pub async fn insert(&self, user: UserId, conn: &Arc<Connection>) {
        let mut inner = self.inner.write().await;
        if let Some((old_user, _)) = inner.by_conn.remove(&conn.id) {
            detach(&mut inner.by_user, old_user, conn.id);
        }
        inner.by_conn.insert(conn.id, (user, Arc::downgrade(conn)));
        inner.by_user.entry(user).or_default().insert(conn.id);
        debug!(conn = conn.id, %user, "connection registered");
    }

    /// Drops a connection's entry. Called synchronously at disconnect
    /// and on logout; a no-op when the connection was never registered.
    pub async fn remove(&self, conn_id: ConnId) {
        let mut inner = self.inner.write().await;
        if let Some((user, _)) = inner.by_conn.remove(&conn_id) {
            detach(&mut inner.by_user, user, conn_id);
            debug!(conn = conn_id, %user, "connection deregistered");
        }
    }

    /// Looks up one connection for a targeted push.
    pub async fn lookup(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner
            .by_conn
            .get(&conn_id)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// All open connections of one account.
    pub async fn lookup_by_user(&self, user: UserId) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_user.get(&user) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| inner.by_conn.get(id))
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_conn.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_conn.is_empty()
    }

    /// Pushes a serialized notification to one connection.
    ///
    /// Returns `false` when the connection is gone or closing; the
    /// enqueue happens after the registry lock is released.
    pub async fn push_to_connection(&self, conn_id: ConnId, frame: String) -> bool {
        let Some(conn) = self.lookup(conn_id).await else {
            return false;
        };
        conn.send(frame).await
    }

    /// Broadcasts a serialized notification to every open connection of
    /// one account. Returns how many connections were targeted.
    ///
    /// Each enqueue runs as its own task so one backpressured client
    /// cannot delay its siblings (or the caller).
    pub async fn push_to_user(&self, user: UserId, frame: String) -> usize {
        let targets = self.lookup_by_user(user).await;
        let count = targets.len();
        for conn in targets {
            let frame = frame.clone();
            tokio::spawn(async move {
                if !conn.send(frame).await {
                    debug!(conn = conn.id, "notification dropped at teardown");
                }
            });
        }
        count
    }
}

fn detach(by_user: &mut HashMap<UserId, HashSet<ConnId>>, user: UserId, conn_id: ConnId) {
    if let Some(set) = by_user.get_mut(&user) {
        set.remove(&conn_id);
        if set.is_empty() {
            by_user.remove(&user);
        }
    }
}
