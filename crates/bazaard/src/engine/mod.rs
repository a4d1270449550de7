//! The wire state machine driven on top of one accepted connection.
//!
//! Accepting → Upgraded → Draining → Closed. A non-upgrade request is
//! served inline without a state transition; an upgrade runs the
//! WebSocket handshake (cookie session recovery, Set-Cookie minting for
//! browsers) and then the read-loop/write-loop pair: the read loop
//! classifies frames and fans requests out as independent tasks, the
//! write loop races a ping timer against the outbound queue. The two
//! loops join with stop-on-first-completion.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as UpgradeRequest, Response as UpgradeResponse,
};
use tokio_tungstenite::tungstenite::http::header::SET_COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use bazaar_core::{MethodError, Session, SessionId};
use bazaar_protocol::{classify, Frame, Request, Response};

use crate::connection::{Connection, OUTBOUND_CAPACITY};
use crate::dispatch::{MethodHandler, SessionContext};
use crate::engine::http::Rewind;
use crate::listener::ConnectionRunner;
use crate::registry::ConnectionRegistry;
use crate::store::SessionStore;
use crate::transport::Transport;

/// The one method a session-less connection may call; always executed
/// synchronously in the read loop so concurrent floods cannot race
/// creation of the same session.
pub const RECOVER_SESSION: &str = "recover_session";

/// Engine tuning. Defaults match production; tests shrink the timers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upgrade targets must live under this namespace.
    pub api_path: String,
    /// Name of the session cookie.
    pub cookie_name: String,
    /// User-Agent prefix identifying the native app (ping-suppressed).
    pub native_ua_prefix: String,
    /// Outbound idleness before a liveness ping.
    pub ping_interval: Duration,
    /// How long a connection may go without proof of liveness.
    pub liveness_timeout: Duration,
    /// TTL applied to session records on save and recovery.
    pub session_ttl: Duration,
    /// Upper bound on one inbound message.
    pub max_message_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_path: "/api".into(),
            cookie_name: "bzsid".into(),
            native_ua_prefix: "BazaarApp".into(),
            ping_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(60),
            session_ttl: Duration::from_secs(30 * 24 * 3600),
            max_message_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Lifetime of the session cookie handed to browsers.
const COOKIE_MAX_AGE_SECS: u64 = 365 * 24 * 3600;

/// The protocol engine shared by every connection.
pub struct Engine {
    registry: Arc<ConnectionRegistry>,
    store: SessionStore,
    handler: Arc<dyn MethodHandler>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: SessionStore,
        handler: Arc<dyn MethodHandler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            handler,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Drives one connection from accept to teardown.
    pub async fn run_connection(self: Arc<Self>, conn: Arc<Connection>) {
        if let Err(e) = self.serve(Arc::clone(&conn)).await {
            debug!(conn = conn.id, remote = %conn.remote(), error = %e, "connection ended");
        }
        // Teardown: cancellation is broadcast before the registry entry
        // disappears, and removal is synchronous with disconnect.
        conn.close();
        self.registry.remove(conn.id).await;
        info!(conn = conn.id, remote = %conn.remote(), "disconnected");
    }

    async fn serve(&self, conn: Arc<Connection>) -> Result<(), EngineError> {
        // The pre-upgrade phase must stay cancellable, or a connection
        // parked in the handshake would stall the shutdown drain.
        let cancel = conn.cancel_token();
        let upgraded = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = self.upgrade_phase(&conn) => result?,
        };
        // Inline requests and forbidden upgrades end here
        let Some((ws, minted, ping_suppressed)) = upgraded else {
            return Ok(());
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        conn.upgrade(outbound_tx, ping_suppressed);

        let (sink, stream) = ws.split();
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            Arc::clone(&conn),
            self.config.ping_interval,
            ping_suppressed,
        ));

        self.read_loop(&conn, stream, minted).await;

        // Stop on first completion: the read loop ended, force the
        // write loop down (and vice versa inside write_loop).
        conn.close();
        let _ = writer.await;
        Ok(())
    }

    /// Accepting-state handling: TLS handshake, inline serving, and the
    /// WebSocket upgrade with cookie session recovery.
    ///
    /// Returns `None` when the request was served (or rejected) inline.
    #[allow(clippy::type_complexity)]
    async fn upgrade_phase(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<
        Option<(
            WebSocketStream<Rewind<Transport>>,
            Option<SessionId>,
            bool,
        )>,
        EngineError,
    > {
        let raw = conn.take_transport().ok_or(EngineError::TransportGone)?;
        // Deferred TLS handshake happens here, off the accept loop
        let mut transport = raw.establish().await?;

        let (buffered, head) = http::read_head(&mut transport).await?;

        if !head.is_upgrade() {
            // Served inline; the connection state never leaves Accepting
            http::serve_inline(transport, &head).await?;
            return Ok(None);
        }
        if !head.path().starts_with(&self.config.api_path) {
            warn!(conn = conn.id, target = %head.target, "upgrade outside api namespace");
            http::reject_forbidden(transport).await?;
            return Ok(None);
        }

        let cookie_sid = head.cookie(&self.config.cookie_name).map(SessionId::new);
        let ping_suppressed = head.is_native_client(&self.config.native_ua_prefix);
        let minted = match (&cookie_sid, head.is_cookie_capable()) {
            (None, true) => Some(SessionId::generate()),
            _ => None,
        };

        let set_cookie = minted.as_ref().map(|sid| self.session_cookie(sid));
        let install_cookie = move |_req: &UpgradeRequest, mut resp: UpgradeResponse| {
            if let Some(cookie) = set_cookie {
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    resp.headers_mut().append(SET_COOKIE, value);
                }
            }
            Ok(resp)
        };

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_message_bytes);
        ws_config.max_frame_size = Some(self.config.max_message_bytes);

        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            Rewind::new(buffered, transport),
            install_cookie,
            Some(ws_config),
        )
        .await?;
        debug!(conn = conn.id, remote = %conn.remote(), "upgraded");

        // A valid session cookie recovers its session at the handshake
        if let Some(sid) = cookie_sid {
            match self.store.load(sid.clone()).await {
                Ok(Some(record)) => {
                    conn.set_session(Session::from_record(sid.clone(), record));
                    if let Err(e) = self
                        .store
                        .update_lifetime(sid.clone(), self.config.session_ttl)
                        .await
                    {
                        warn!(session = %sid.short(), error = %e, "failed to refresh session ttl");
                    }
                    debug!(conn = conn.id, session = %sid.short(), "session recovered from cookie");
                }
                // A stale cookie is re-minted through recover_session
                Ok(None) => {}
                Err(e) => {
                    warn!(session = %sid.short(), error = %e, "session recovery failed");
                }
            }
        }

        Ok(Some((ws, minted, ping_suppressed)))
    }

    fn session_cookie(&self, sid: &SessionId) -> String {
        format!(
            "{}={}; Path={}; Max-Age={}; HttpOnly; SameSite=Lax",
            self.config.cookie_name, sid, self.config.api_path, COOKIE_MAX_AGE_SECS
        )
    }

    /// One task per connection: classify and dispatch inbound frames
    /// until violation, liveness breach, close, or cancellation.
    async fn read_loop(
        &self,
        conn: &Arc<Connection>,
        mut stream: SplitStream<WebSocketStream<Rewind<Transport>>>,
        mut minted: Option<SessionId>,
    ) {
        let cancel = conn.cancel_token();
        let mut deadline = Instant::now() + self.config.liveness_timeout;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::time::timeout_at(deadline, stream.next()) => read,
            };

            let msg = match next {
                Err(_) => {
                    debug!(conn = conn.id, "liveness deadline missed");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(conn = conn.id, error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Pong(_) => {
                    deadline = Instant::now() + self.config.liveness_timeout;
                }
                // A client-originated ping proves liveness too; the
                // protocol layer queues the pong reply itself.
                Message::Ping(_) => {
                    deadline = Instant::now() + self.config.liveness_timeout;
                }
                Message::Close(_) => break,
                Message::Text(text) => {
                    deadline = Instant::now() + self.config.liveness_timeout;
                    if !self.handle_text(conn, text, &mut minted).await {
                        break;
                    }
                }
                // The wire protocol is whole-message JSON text; binary
                // is treated like any other malformed payload.
                Message::Binary(_) => {
                    warn!(conn = conn.id, "binary frame on json-rpc session");
                    break;
                }
                Message::Frame(_) => {}
            }
        }
    }

    /// Returns `false` when the frame is a fatal protocol violation.
    async fn handle_text(
        &self,
        conn: &Arc<Connection>,
        text: String,
        minted: &mut Option<SessionId>,
    ) -> bool {
        match classify(&text) {
            // Abusive client: no reply, tear the connection down
            Frame::Malformed => {
                warn!(conn = conn.id, remote = %conn.remote(), "malformed payload");
                false
            }
            Frame::Invalid { id } => {
                conn.send(Response::error(id, MethodError::invalid_request()).into_json())
                    .await;
                true
            }
            Frame::Call(req) if req.method == RECOVER_SESSION => {
                // Synchronous on purpose: serializing bootstrap stops
                // concurrent floods racing creation of one session
                let reply = self.recover_session(conn, minted, req.id).await;
                conn.send(reply.into_json()).await;
                true
            }
            Frame::Call(req) => {
                if conn.session().is_none() {
                    conn.send(
                        Response::error(req.id, MethodError::session_needed()).into_json(),
                    )
                    .await;
                    return true;
                }
                self.spawn_dispatch(conn, req);
                true
            }
        }
    }

    async fn recover_session(
        &self,
        conn: &Arc<Connection>,
        minted: &mut Option<SessionId>,
        id: Option<serde_json::Value>,
    ) -> Response {
        if let Some(session) = conn.session() {
            return Response::result(
                id,
                json!({ "session_id": session.id, "isLogin": session.is_logged_in() }),
            );
        }

        // Reuse the id already promised via Set-Cookie, if one was minted
        let sid = minted.take().unwrap_or_else(SessionId::generate);
        let session = Session::new(sid.clone());
        match self
            .store
            .save(sid.clone(), session.to_record(), self.config.session_ttl)
            .await
        {
            Ok(()) => {
                conn.set_session(session);
                debug!(conn = conn.id, session = %sid.short(), "session created");
                Response::result(id, json!({ "session_id": sid, "isLogin": false }))
            }
            Err(e) => {
                warn!(session = %sid.short(), error = %e, "failed to persist new session");
                *minted = Some(sid);
                Response::error(id, MethodError::store_unavailable())
            }
        }
    }

    /// Fan-out: each request runs as its own task with a child
    /// cancellation token; the read loop never waits for it, so replies
    /// on one connection may complete out of order. The request `id`
    /// echoed into the reply is the client's only correlation handle.
    fn spawn_dispatch(&self, conn: &Arc<Connection>, req: Request) {
        let conn = Arc::clone(conn);
        let handler = Arc::clone(&self.handler);
        let ctx = SessionContext::new(
            Arc::clone(&conn),
            self.store.clone(),
            Arc::clone(&self.registry),
            self.config.session_ttl,
        );
        let child = conn.child_token();
        let Request {
            method, params, id, ..
        } = req;

        tokio::spawn(async move {
            let outcome = tokio::select! {
                // Disconnect aborts the in-flight call; no reply is owed
                _ = child.cancelled() => None,
                result = handler.call(&ctx, &method, params) => Some(result),
            };
            let Some(result) = outcome else {
                debug!(conn = conn.id, method = %method, "request cancelled");
                return;
            };
            let reply = match result {
                Ok(value) => Response::result(id, value),
                // Domain errors become structured replies, nothing more
                Err(e) => Response::error(id, e),
            };
            conn.send(reply.into_json()).await;
        });
    }
}

impl ConnectionRunner for Engine {
    fn run(self: Arc<Self>, conn: Arc<Connection>) -> futures::future::BoxFuture<'static, ()> {
        Box::pin(self.run_connection(conn))
    }
}

/// One task per connection: races the ping timer against the outbound
/// queue, preserving FIFO order of whatever is enqueued.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<Rewind<Transport>>, Message>,
    mut outbound: mpsc::Receiver<String>,
    conn: Arc<Connection>,
    ping_interval: Duration,
    ping_suppressed: bool,
) {
    loop {
        match tokio::time::timeout(ping_interval, outbound.recv()).await {
            // Outbound idleness: emit a liveness ping and re-arm
            Err(_) => {
                if ping_suppressed {
                    continue;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            // Queue closed: the connection is being torn down
            Ok(None) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Ok(Some(frame)) => {
                // The empty frame is the "close now" sentinel
                if frame.is_empty() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        }
    }
    // Whichever loop finishes first forces the other down
    conn.close();
}

/// Errors that end a connection before or during the upgrade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The transport was already claimed or torn down.
    #[error("transport unavailable")]
    TransportGone,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_protocol_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.ping_interval, Duration::from_secs(15));
        assert_eq!(cfg.liveness_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_message_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.api_path, "/api");
    }

    #[test]
    fn test_session_cookie_shape() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::channel(1);
        let store = SessionStore::new(tx);
        let engine = Engine::new(
            registry,
            store,
            Arc::new(crate::dispatch::UnroutedHandler),
            EngineConfig::default(),
        );
        let sid = SessionId::new("abc");
        let cookie = engine.session_cookie(&sid);
        assert!(cookie.starts_with("bzsid=abc; Path=/api; Max-Age=31536000"));
        assert!(cookie.contains("HttpOnly"));
    }
}
