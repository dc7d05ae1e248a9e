//! TCP listener and connection dispatch

use crate::config::ProxyConfig;
use crate::connection::{Connection, ConnectionContext};
use crate::seed::Seed;
use crate::stats::Statistics;
use crate::ProxyError;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Accept loop host: binds the configured listen address and spawns one
/// task per accepted socket. One instance per process, either role.
pub struct Server {
    config: Arc<ProxyConfig>,
    seed: Arc<Seed>,
    stats: Arc<Statistics>,
}

impl Server {
    pub fn new(config: Arc<ProxyConfig>, seed: Arc<Seed>, stats: Arc<Statistics>) -> Self {
        Self {
            config,
            seed,
            stats,
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        log::info!(
            "{} listening on {} -> {}:{}",
            self.config.role,
            self.config.listen,
            self.config.upstream_host,
            self.config.upstream_port
        );
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Per-connection faults are
    /// handled inside the spawned task; an accept error is listener-fatal
    /// and propagates to the caller.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let context = Arc::new(ConnectionContext::new(peer));
            let id = context.id();
            if !self.stats.register(&context) {
                log::warn!("[{id}] duplicate connection id, dropping socket");
                continue;
            }
            log::info!("[{id}] accepted connection from {peer}");

            let connection = Connection::new(
                context,
                Arc::clone(&self.config),
                Arc::clone(&self.seed),
                Arc::clone(&self.stats),
            );
            tokio::spawn(async move {
                connection.process_client(socket).await;
            });
        }
    }
}
