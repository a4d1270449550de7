//! Wires the pool, store, registry, engine and listeners together.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::dispatch::MethodHandler;
use crate::engine::Engine;
use crate::listener::Listener;
use crate::pool::LoopPool;
use crate::registry::ConnectionRegistry;
use crate::store::{spawn_store, spawn_sweeper, StoreError};
use crate::transport::{build_tls_acceptor, BoundListener, TransportError};

/// The assembled gateway.
///
/// Owns no global state: every component is constructed here and passed
/// by reference to whoever needs it.
pub struct GatewayServer {
    config: Config,
    pool: Arc<LoopPool>,
    handler: Arc<dyn MethodHandler>,
    cancel: CancellationToken,
}

impl GatewayServer {
    pub fn new(
        config: Config,
        pool: Arc<LoopPool>,
        handler: Arc<dyn MethodHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            pool,
            handler,
            cancel,
        }
    }

    /// Runs the gateway until the cancellation token fires, then drains
    /// every listener. Intended to be driven on the accept loop via
    /// [`LoopPool::run`].
    pub async fn run(&self) -> Result<(), ServerError> {
        let store = spawn_store(&self.config.session.db_path, &self.pool.store_loop())?;
        let registry = Arc::new(ConnectionRegistry::new());
        let _sweeper = spawn_sweeper(
            store.clone(),
            self.config.sweep_interval(),
            self.cancel.clone(),
            &self.pool.scheduler(),
        );

        let engine = Arc::new(Engine::new(
            registry,
            store,
            Arc::clone(&self.handler),
            self.config.engine_config(),
        ));

        // Shared counter so connection ids are unique across listeners
        let next_id = Arc::new(AtomicU64::new(1));
        let mut listeners = Vec::with_capacity(self.config.listeners.len());

        for entry in &self.config.listeners {
            let addr = entry.listen_addr()?;
            let tls = match (&entry.cert, &entry.key) {
                (Some(cert), Some(key)) => Some(build_tls_acceptor(cert, key)?),
                _ => None,
            };
            let bound = BoundListener::bind(&addr, entry.ipv6_only, tls)?;
            info!(%addr, "listening");

            let listener = Arc::new(Listener::new(
                bound,
                Arc::clone(&self.pool),
                Arc::clone(&next_id),
                self.cancel.child_token(),
            ));
            listener.run_accept_loop(self.config.accept_tasks, engine.clone());
            listeners.push(listener);
        }

        self.cancel.cancelled().await;
        info!("shutdown requested, draining connections");

        for listener in &listeners {
            listener.clean_shutdown().await;
        }
        info!("gateway stopped");
        Ok(())
    }
}

/// Errors that stop the gateway from starting.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
