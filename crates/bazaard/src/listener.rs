//! Accept loop and graceful drain for one bound address.
//!
//! Each listener spawns N concurrent accept tasks on the accept loop.
//! Every accepted socket becomes a [`Connection`] with a monotonically
//! increasing id, lands in the accepted-set, and is handed to the
//! caller-supplied runner as an independent task on the next worker
//! loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnId, Connection};
use crate::pool::LoopPool;
use crate::transport::BoundListener;

/// Interval between accepted-set polls during shutdown. Shutdown is
/// rare and latency-insensitive; polling beats a wait/notify primitive
/// on simplicity.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs one connection to completion. The protocol engine implements
/// this; tests substitute their own.
pub trait ConnectionRunner: Send + Sync + 'static {
    fn run(self: Arc<Self>, conn: Arc<Connection>) -> BoxFuture<'static, ()>;
}

/// Live connections accepted by one listener.
type AcceptedSet = Arc<RwLock<HashMap<ConnId, Arc<Connection>>>>;

/// One bound address with its accept machinery.
pub struct Listener {
    bound: BoundListener,
    pool: Arc<LoopPool>,

    /// Shared across listeners so connection ids are process-unique.
    next_id: Arc<AtomicU64>,

    /// Connections accepted here and not yet finished.
    accepted: AcceptedSet,

    /// Stops the accept tasks.
    cancel: CancellationToken,
}

impl Listener {
    pub fn new(
        bound: BoundListener,
        pool: Arc<LoopPool>,
        next_id: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bound,
            pool,
            next_id,
            accepted: Arc::new(RwLock::new(HashMap::new())),
            cancel,
        }
    }

    /// The bound local address, when the kind has one.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.bound.local_addr()
    }

    /// Number of connections still tracked by this listener.
    pub async fn accepted_count(&self) -> usize {
        self.accepted.read().await.len()
    }

    /// Spawns `concurrency` accept tasks on the current (accept) loop.
    pub fn run_accept_loop(
        self: &Arc<Self>,
        concurrency: usize,
        runner: Arc<dyn ConnectionRunner>,
    ) {
        for _ in 0..concurrency.max(1) {
            let listener = Arc::clone(self);
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                listener.accept_task(runner).await;
            });
        }
    }

    async fn accept_task(&self, runner: Arc<dyn ConnectionRunner>) {
        loop {
            let raw = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.bound.accept() => match accepted {
                    Ok(raw) => raw,
                    Err(e) if is_fatal_accept_error(&e) => {
                        error!(error = %e, "accept loop terminating");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let conn = Arc::new(Connection::new(id, raw));
            debug!(conn = id, remote = %conn.remote(), "accepted");

            self.accepted.write().await.insert(id, Arc::clone(&conn));

            let accepted = Arc::clone(&self.accepted);
            let runner = Arc::clone(&runner);
            // Connections are balanced round-robin over worker loops
            self.pool.next().spawn(async move {
                runner.run(conn).await;
                accepted.write().await.remove(&id);
            });
        }
    }

    /// Closes every tracked connection, then polls the accepted-set at
    /// short intervals until it is empty.
    pub async fn clean_shutdown(&self) {
        self.cancel.cancel();

        {
            let accepted = self.accepted.read().await;
            info!(open = accepted.len(), "draining listener");
            for conn in accepted.values() {
                conn.close();
            }
        }

        loop {
            if self.accepted.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.bound.cleanup();
        debug!("listener drained");
    }
}

/// Only "descriptor closed" and "operation canceled" end the accept
/// loop; every other accept error is transient.
fn is_fatal_accept_error(e: &std::io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ECANCELED))
}
