//! The seam between the gateway core and business logic.
//!
//! A [`MethodHandler`] receives (session context, method name, params)
//! and returns a result value or a typed [`MethodError`]. Everything
//! the marketplace does (carts, orders, goods, admin) plugs in here;
//! the gateway itself knows only `recover_session`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use bazaar_core::{MethodError, Session, SessionId};

use crate::connection::{ConnId, Connection};
use crate::registry::ConnectionRegistry;
use crate::store::SessionStore;

/// External method handler: the only integration point between the
/// connection core and business logic.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handles one request. Domain failures surface as [`MethodError`]
    /// and become structured error replies; they never tear the
    /// connection down.
    async fn call(
        &self,
        ctx: &SessionContext,
        method: &str,
        params: Value,
    ) -> Result<Value, MethodError>;
}

/// Handler wired in when no business logic is mounted: every method is
/// unknown.
pub struct UnroutedHandler;

#[async_trait]
impl MethodHandler for UnroutedHandler {
    async fn call(
        &self,
        _ctx: &SessionContext,
        method: &str,
        _params: Value,
    ) -> Result<Value, MethodError> {
        Err(MethodError::method_not_found(method))
    }
}

/// The handler's view of one request's session, plus the machinery to
/// persist session changes and keep the registry in sync.
pub struct SessionContext {
    conn: Arc<Connection>,
    store: SessionStore,
    registry: Arc<ConnectionRegistry>,
    session_ttl: Duration,
}

impl SessionContext {
    pub fn new(
        conn: Arc<Connection>,
        store: SessionStore,
        registry: Arc<ConnectionRegistry>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            conn,
            store,
            registry,
            session_ttl,
        }
    }

    /// The connection this request arrived on.
    pub fn conn_id(&self) -> ConnId {
        self.conn.id
    }

    /// The session id (always present once dispatch runs).
    pub fn session_id(&self) -> SessionId {
        self.conn.session_id().unwrap_or_default()
    }

    /// A snapshot of the session. Handlers mutate through
    /// [`update`](Self::update), never through the snapshot.
    pub fn session(&self) -> Session {
        self.conn
            .session()
            .unwrap_or_else(|| Session::new(SessionId::default()))
    }

    /// The registry, for pushing notifications to other users.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Applies `mutate` to the session, persists the new record, and
    /// keeps the connection registry in sync with the login state.
    ///
    /// Persistence failure is a recoverable error for the caller; the
    /// in-memory mutation is kept so a later save can catch up.
    pub async fn update(
        &self,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<(), MethodError> {
        let before = self.conn.user_id();
        let snapshot = self.conn.with_session(|session| {
            mutate(session);
            (session.id.clone(), session.to_record())
        });
        let Some((id, record)) = snapshot else {
            return Err(MethodError::session_needed());
        };
        let after = self.conn.user_id();

        if after != before {
            match after {
                Some(user) => self.registry.insert(user, &self.conn).await,
                None => self.registry.remove(self.conn.id).await,
            }
        }

        if let Err(e) = self.store.save(id.clone(), record, self.session_ttl).await {
            warn!(session = %id.short(), error = %e, "failed to persist session");
            return Err(MethodError::store_unavailable());
        }
        Ok(())
    }

    /// Refreshes the session's TTL without changing the record.
    pub async fn touch(&self) -> Result<(), MethodError> {
        let Some(id) = self.conn.session_id() else {
            return Err(MethodError::session_needed());
        };
        self.store
            .update_lifetime(id, self.session_ttl)
            .await
            .map_err(|_| MethodError::store_unavailable())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RawTransport;
    use crate::store::StoreActor;
    use bazaar_core::{Principal, UserId};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    async fn test_ctx() -> (SessionContext, Arc<Connection>, Arc<ConnectionRegistry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (stream, _) = listener.accept().await.unwrap();
        let _ = client.await.unwrap();

        let conn = Arc::new(Connection::new(1, RawTransport::Tcp(stream)));
        conn.set_session(Session::new(SessionId::new("ctx-1")));

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(StoreActor::in_memory(rx).expect("store").run());
        let store = SessionStore::new(tx);
        let registry = Arc::new(ConnectionRegistry::new());

        let ctx = SessionContext::new(
            Arc::clone(&conn),
            store,
            Arc::clone(&registry),
            Duration::from_secs(60),
        );
        (ctx, conn, registry)
    }

    #[tokio::test]
    async fn test_login_registers_connection() {
        let (ctx, conn, registry) = test_ctx().await;

        ctx.update(|s| s.login(Principal::User { user: UserId(8) }))
            .await
            .unwrap();

        assert_eq!(conn.user_id(), Some(UserId(8)));
        assert_eq!(registry.lookup_by_user(UserId(8)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_logout_deregisters_connection() {
        let (ctx, _conn, registry) = test_ctx().await;

        ctx.update(|s| s.login(Principal::User { user: UserId(8) }))
            .await
            .unwrap();
        ctx.update(|s| s.logout()).await.unwrap();

        assert!(registry.lookup_by_user(UserId(8)).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_persists_record() {
        let (ctx, _conn, _registry) = test_ctx().await;

        ctx.update(|s| s.verify_phone = Some("15550003333".into()))
            .await
            .unwrap();

        let session = ctx.session();
        assert_eq!(session.verify_phone.as_deref(), Some("15550003333"));
    }

    #[tokio::test]
    async fn test_unrouted_handler_rejects_everything() {
        let (ctx, _conn, _registry) = test_ctx().await;
        let err = UnroutedHandler
            .call(&ctx, "goods_list", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code, bazaar_core::codes::METHOD_NOT_FOUND);
    }
}
