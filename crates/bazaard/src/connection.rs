//! Per-connection state shared between the read loop, the write loop,
//! dispatched request tasks, and the connection registry.
//!
//! Exactly one `Connection` exists per accepted transport. The
//! transport itself is claimed by the protocol engine at upgrade time
//! and from then on is exclusively owned by the connection's read and
//! write tasks; everything here is the state those tasks (and outside
//! pushers) share.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use bazaar_core::{Session, SessionId, UserId};

pub(crate) use crate::transport::RawTransport;

/// Monotonically increasing connection identifier, scoped to one
/// gateway process.
pub type ConnId = u64;

/// Capacity of the outbound queue. One slot is enough: the write loop
/// drains it continuously and senders suspend on backpressure.
pub const OUTBOUND_CAPACITY: usize = 1;

/// The sentinel frame meaning "close now" when popped by the write loop.
pub const CLOSE_SENTINEL: &str = "";

/// State added once the connection upgrades to the message protocol.
pub struct UpgradedState {
    /// Bounded queue feeding the write loop.
    pub outbound: mpsc::Sender<String>,
    /// Native clients do their own liveness; no server pings for them.
    pub ping_suppressed: bool,
}

/// One accepted client connection.
pub struct Connection {
    /// Connection id, unique within the process.
    pub id: ConnId,

    /// Peer label for logs.
    remote: String,

    /// The accepted transport, claimed once by the protocol engine.
    transport: Mutex<Option<RawTransport>>,

    /// Session attached after recovery; absent until then.
    session: Mutex<Option<Session>>,

    /// Upgraded-protocol sub-state; absent while still accepting.
    upgraded: Mutex<Option<UpgradedState>>,

    /// Parent cancellation context. Every dispatched request derives a
    /// child token, so cancelling this cancels every pending request
    /// with no per-request bookkeeping.
    cancel: CancellationToken,

    /// Guard making [`close`](Self::close) idempotent.
    closed: AtomicBool,
}

impl Connection {
    /// Wraps a freshly accepted transport.
    pub fn new(id: ConnId, transport: RawTransport) -> Self {
        let remote = transport.peer_label();
        Self {
            id,
            remote,
            transport: Mutex::new(Some(transport)),
            session: Mutex::new(None),
            upgraded: Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Peer label for logs.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Claims the transport. Returns `None` on the second call or after
    /// close; the engine calls this exactly once.
    pub fn take_transport(&self) -> Option<RawTransport> {
        self.transport.lock().take()
    }

    /// Installs the upgraded-protocol sub-state.
    pub fn upgrade(&self, outbound: mpsc::Sender<String>, ping_suppressed: bool) {
        *self.upgraded.lock() = Some(UpgradedState {
            outbound,
            ping_suppressed,
        });
    }

    /// Whether server pings are suppressed for this client.
    pub fn ping_suppressed(&self) -> bool {
        self.upgraded
            .lock()
            .as_ref()
            .map(|u| u.ping_suppressed)
            .unwrap_or(false)
    }

    /// Clones the outbound sender, if upgraded.
    pub fn outbound(&self) -> Option<mpsc::Sender<String>> {
        self.upgraded.lock().as_ref().map(|u| u.outbound.clone())
    }

    /// Enqueues a serialized frame for the write loop.
    ///
    /// Suspends on backpressure but never outlives the connection:
    /// returns `false` when the connection closes first, was never
    /// upgraded, or the write loop is gone.
    pub async fn send(&self, frame: String) -> bool {
        let Some(tx) = self.outbound() else {
            return false;
        };
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = tx.send(frame) => sent.is_ok(),
        }
    }

    /// A snapshot of the attached session.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    /// The attached session's id.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().as_ref().map(|s| s.id.clone())
    }

    /// The authenticated account, if the session is logged in.
    pub fn user_id(&self) -> Option<UserId> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.effective_principal().map(|p| p.user_id()))
    }

    /// Attaches a recovered or freshly minted session.
    pub fn set_session(&self, session: Session) {
        *self.session.lock() = Some(session);
    }

    /// Runs `f` against the attached session, if any.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.session.lock().as_mut().map(f)
    }

    /// Derives a child cancellation token for one dispatched request.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// A token observers can wait on for connection teardown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether close has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tears the connection down. Idempotent.
    ///
    /// Broadcasts cancellation to every pending request (via the parent
    /// token), pushes the close sentinel onto the outbound queue, and
    /// releases any unclaimed transport. Invoked from Drop as well, so
    /// a panic, early return, or external disconnect trigger can never
    /// leave the transport half-torn-down or a cancellation un-emitted.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = self.id, remote = %self.remote, "closing connection");

        // Cancel before the sentinel: dispatched tasks observe it even
        // when the sentinel cannot be enqueued.
        self.cancel.cancel();

        if let Some(upgraded) = self.upgraded.lock().take() {
            // The queue closes when this last sender drops; the
            // sentinel just makes the write loop exit without waiting
            // for the timer race.
            let _ = upgraded.outbound.try_send(CLOSE_SENTINEL.to_string());
        }

        // A transport never claimed by the engine is torn down here.
        drop(self.transport.lock().take());
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_core::Principal;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_connection(id: ConnId) -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let (stream, _) = listener.accept().await.unwrap();
        let _ = client.await.unwrap();
        Connection::new(id, RawTransport::Tcp(stream))
    }

    #[tokio::test]
    async fn test_transport_claimed_once() {
        let conn = test_connection(1).await;
        assert!(conn.take_transport().is_some());
        assert!(conn.take_transport().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = test_connection(2).await;
        let (tx, mut rx) = mpsc::channel(OUTBOUND_CAPACITY);
        conn.upgrade(tx, false);

        conn.close();
        conn.close();

        assert!(conn.is_closed());
        assert!(conn.cancel_token().is_cancelled());
        // Exactly one sentinel, then the channel is closed
        assert_eq!(rx.recv().await.as_deref(), Some(CLOSE_SENTINEL));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_cancels_children() {
        let conn = test_connection(3).await;
        let child = conn.child_token();
        assert!(!child.is_cancelled());
        conn.close();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let conn = test_connection(4).await;
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        conn.upgrade(tx, false);
        conn.close();
        assert!(!conn.send("{}".into()).await);
    }

    #[tokio::test]
    async fn test_send_without_upgrade_fails() {
        let conn = test_connection(5).await;
        assert!(!conn.send("{}".into()).await);
    }

    #[tokio::test]
    async fn test_session_accessors() {
        let conn = test_connection(6).await;
        assert!(conn.session().is_none());
        assert!(conn.user_id().is_none());

        let mut session = Session::new(SessionId::new("s1"));
        session.login(Principal::User {
            user: UserId(44),
        });
        conn.set_session(session);

        assert_eq!(conn.session_id(), Some(SessionId::new("s1")));
        assert_eq!(conn.user_id(), Some(UserId(44)));

        conn.with_session(|s| s.logout());
        assert!(conn.user_id().is_none());
    }

    #[tokio::test]
    async fn test_ping_suppression_flag() {
        let conn = test_connection(7).await;
        assert!(!conn.ping_suppressed());
        let (tx, _rx) = mpsc::channel(OUTBOUND_CAPACITY);
        conn.upgrade(tx, true);
        assert!(conn.ping_suppressed());
    }
}
