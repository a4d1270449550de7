//! Fixed pool of single-threaded cooperative run loops.
//!
//! Every loop is a current-thread tokio runtime owning one OS thread.
//! Three loops are reserved: the accept loop (driven by the caller's
//! thread via [`LoopPool::run`]), the scheduler loop (timers, sweeps),
//! and the store loop (blocking persistence calls, isolated so they can
//! never stall a network loop). The remaining worker loops host
//! connection tasks, assigned round-robin by [`LoopPool::next`].
//!
//! A loop that dies from an unhandled fault is fatal to the process:
//! there is no supervisor, and work already scheduled on the dead loop
//! cannot be recovered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long a stopping loop may spend finishing in-flight tasks.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// One reserved or worker run loop: a current-thread runtime pinned to
/// its own thread, stopped through a cancellation token.
struct RunLoop {
    handle: Handle,
    stop: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl RunLoop {
    /// Spawns a named thread driving a fresh current-thread runtime.
    ///
    /// The thread parks on the stop token; tasks spawned through the
    /// returned handle run on it until `stop` fires.
    fn spawn(name: &str) -> Result<Self, PoolError> {
        let stop = CancellationToken::new();
        let loop_stop = stop.clone();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    runtime.block_on(loop_stop.cancelled());
                    runtime.shutdown_timeout(SHUTDOWN_GRACE);
                }));
                // No supervisor exists: a faulted loop takes the process with it.
                if outcome.is_err() {
                    eprintln!("run loop died from an unhandled fault, aborting");
                    std::process::abort();
                }
            })
            .map_err(|e| PoolError::Thread(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| PoolError::Thread("loop thread exited before handing a handle".into()))?
            .map_err(|e| PoolError::Runtime(e.to_string()))?;

        Ok(Self {
            handle,
            stop,
            thread: Some(thread),
        })
    }
}

/// The fixed set of run loops the whole gateway schedules onto.
pub struct LoopPool {
    /// Accept runtime, driven by the thread that calls [`run`](Self::run).
    accept: Runtime,

    /// Reserved loop for timers and periodic maintenance.
    scheduler: RunLoop,

    /// Reserved loop for blocking persistence calls.
    store: RunLoop,

    /// Worker loops hosting connection tasks.
    workers: Vec<RunLoop>,

    /// Round-robin cursor over `workers`.
    cursor: AtomicUsize,

    /// Set once [`stop`](Self::stop) has run.
    joined: Mutex<bool>,
}

impl LoopPool {
    /// Builds the pool: the accept runtime plus `workers` worker loops
    /// and the two reserved loops.
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let workers = workers.max(1);

        let accept = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| PoolError::Runtime(e.to_string()))?;

        let scheduler = RunLoop::spawn("bazaar-sched")?;
        let store = RunLoop::spawn("bazaar-store")?;

        let mut loops = Vec::with_capacity(workers);
        for n in 0..workers {
            loops.push(RunLoop::spawn(&format!("bazaar-worker-{n}"))?);
        }

        info!(workers, "execution pool started");

        Ok(Self {
            accept,
            scheduler,
            store,
            workers: loops,
            cursor: AtomicUsize::new(0),
            joined: Mutex::new(false),
        })
    }

    /// Pins the calling thread to the accept loop, driving `future` to
    /// completion on it.
    pub fn run<F: std::future::Future>(&self, future: F) -> F::Output {
        self.accept.block_on(future)
    }

    /// Handle of the accept loop, for spawning accept tasks.
    pub fn accept_handle(&self) -> Handle {
        self.accept.handle().clone()
    }

    /// Round-robins over worker loops to balance new connections.
    pub fn next(&self) -> Handle {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        // workers is never empty (clamped in new); the fallback keeps
        // this total anyway
        match self.workers.get(n % self.workers.len()) {
            Some(worker) => worker.handle.clone(),
            None => self.scheduler.handle.clone(),
        }
    }

    /// Handle of the reserved scheduler loop.
    pub fn scheduler(&self) -> Handle {
        self.scheduler.handle.clone()
    }

    /// Handle of the reserved persistence loop.
    pub fn store_loop(&self) -> Handle {
        self.store.handle.clone()
    }

    /// Number of worker loops.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tears down every loop, letting in-flight cooperative tasks
    /// finish naturally within the grace period.
    pub fn stop(&self) {
        let mut joined = self.joined.lock();
        if *joined {
            return;
        }
        *joined = true;

        debug!("stopping execution pool");
        self.scheduler.stop.cancel();
        self.store.stop.cancel();
        for worker in &self.workers {
            worker.stop.cancel();
        }
        // All tokens fire before any join so the loops drain in parallel.
        for worker in &self.workers {
            Self::join(&worker.thread);
        }
        Self::join(&self.scheduler.thread);
        Self::join(&self.store.thread);
        info!("execution pool stopped");
    }

    fn join(thread: &Option<std::thread::JoinHandle<()>>) {
        if let Some(t) = thread {
            // Threads unpark as soon as their token fires; polling the
            // finished flag avoids taking ownership of the JoinHandle.
            while !t.is_finished() {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl Drop for LoopPool {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Errors raised while building the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn loop thread: {0}")]
    Thread(String),

    #[error("failed to build runtime: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_round_robin_cycles_workers() {
        let pool = LoopPool::new(3).expect("build pool");
        let ids: Vec<_> = (0..6).map(|_| pool.next().id()).collect();
        // Cycle of length 3 repeats
        assert_eq!(ids[0], ids[3]);
        assert_eq!(ids[1], ids[4]);
        assert_eq!(ids[2], ids[5]);
        assert_ne!(ids[0], ids[1]);
        pool.stop();
    }

    #[test]
    fn test_worker_count_clamped_to_one() {
        let pool = LoopPool::new(0).expect("build pool");
        assert_eq!(pool.worker_count(), 1);
        pool.stop();
    }

    #[test]
    fn test_tasks_run_on_worker_loops() {
        let pool = LoopPool::new(2).expect("build pool");
        let (tx, rx) = std::sync::mpsc::channel();
        pool.next().spawn(async move {
            let _ = tx.send(42u32);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        pool.stop();
    }

    #[test]
    fn test_run_pins_caller_to_accept_loop() {
        let pool = LoopPool::new(1).expect("build pool");
        let out = pool.run(async { 7u8 });
        assert_eq!(out, 7);
        pool.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = LoopPool::new(1).expect("build pool");
        pool.stop();
        pool.stop();
    }
}
