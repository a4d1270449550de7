//! Durable, TTL-expiring session persistence.
//!
//! Backed by an embedded SQLite database whose API is blocking, so the
//! actor runs on the pool's dedicated persistence loop; callers suspend
//! on a oneshot and never block a network loop. A background sweep task
//! on the scheduler loop periodically deletes expired records.

mod actor;
mod commands;
mod handle;

pub use actor::StoreActor;
pub use commands::{StoreCommand, StoreError};
pub use handle::SessionStore;

use std::path::Path;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Command channel depth. Persistence commands are small and the actor
/// drains quickly; callers block on the channel under sustained load.
const COMMAND_BUFFER: usize = 64;

/// Opens the database and spawns the store actor on `persistence_loop`.
pub fn spawn_store(
    db_path: &Path,
    persistence_loop: &Handle,
) -> Result<SessionStore, StoreError> {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let actor = StoreActor::open(db_path, rx)?;
    persistence_loop.spawn(actor.run());
    info!(db = %db_path.display(), "session store started");
    Ok(SessionStore::new(tx))
}

/// Spawns the periodic expiry sweep on `scheduler_loop`.
///
/// Each tick sends a fire-and-forget sweep command; the deletion itself
/// runs on the persistence loop inside one write transaction.
pub fn spawn_sweeper(
    store: SessionStore,
    interval: Duration,
    cancel: CancellationToken,
    scheduler_loop: &Handle,
) -> tokio::task::JoinHandle<()> {
    scheduler_loop.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    store.sweep().await;
                }
            }
        }
    })
}
