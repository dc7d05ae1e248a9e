//! Per-connection state machine: validate, dial upstream, relay, tear down

use crate::config::{ProxyConfig, Role};
use crate::obfuscate::ObfuscatedStream;
use crate::relay;
use crate::seed::Seed;
use crate::state::ConnectionState;
use crate::stats::Statistics;
use crate::trace::{ConnectionId, TraceInfo};
use crate::validator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Shared per-connection context: identity plus the telemetry record. The
/// sockets themselves are owned by the driving [`Connection`], so the
/// upstream leg can only ever be attached once.
pub struct ConnectionContext {
    trace: TraceInfo,
}

impl ConnectionContext {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            trace: TraceInfo::with_remote_addr(ConnectionId::generate(), remote_addr),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.trace.id()
    }

    pub fn trace(&self) -> &TraceInfo {
        &self.trace
    }
}

/// Drives one accepted socket end to end.
pub struct Connection {
    context: Arc<ConnectionContext>,
    config: Arc<ProxyConfig>,
    seed: Arc<Seed>,
    stats: Arc<Statistics>,
}

impl Connection {
    pub fn new(
        context: Arc<ConnectionContext>,
        config: Arc<ProxyConfig>,
        seed: Arc<Seed>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            context,
            config,
            seed,
            stats,
        }
    }

    /// Process the connection: validate (server role), dial the upstream,
    /// relay until both directions end, then tear everything down. Returns
    /// only once the connection is fully closed and deregistered; faults in
    /// any phase abort that phase and fall through to teardown.
    pub async fn process_client<S>(self, mut downstream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let id = self.context.id();
        let trace = self.context.trace();
        trace.set_state(ConnectionState::WaitingForValidation);

        let valid = match self.config.role {
            // The client role initiates tunnels; inbound traffic here is
            // the local application, never an untrusted tunnel peer.
            Role::Client => true,
            Role::Server => {
                log::debug!("[{id}] validating inbound connection");
                validator::validate(id, &mut downstream, &self.seed).await
            }
        };
        trace.set_state(if valid {
            ConnectionState::ValidationPassed
        } else {
            ConnectionState::ValidationFailed
        });

        if valid {
            self.run_tunnel(id, downstream).await;
        } else {
            // Hold the rejected socket open for a random while so rejection
            // timing does not fingerprint the service.
            let delay = self.seed.close_delay();
            log::info!("[{id}] validation failed, closing in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
            if let Err(e) = downstream.shutdown().await {
                log::debug!("[{id}] error closing rejected connection: {e}");
            }
        }

        trace.set_state(ConnectionState::Closed);
        log::info!(
            "[{id}] connection closed: started {}, ended {}, up {}B ({}/s avg), down {}B ({}/s avg)",
            trace.start_time().format("%Y-%m-%d %H:%M:%S%.3f"),
            trace
                .end_time()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                .unwrap_or_else(|| "-".to_string()),
            trace.up_bytes(),
            trace.up_avg_speed().round(),
            trace.down_bytes(),
            trace.down_avg_speed().round(),
        );

        // Last step of teardown: drop out of the live connection table.
        self.stats.unregister(&self.context);
    }

    async fn run_tunnel<S>(&self, id: ConnectionId, mut downstream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let trace = self.context.trace();
        trace.set_state(ConnectionState::ConnectingUpstream);

        let host = self.config.upstream_host.as_str();
        let port = self.config.upstream_port;
        let mut upstream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("[{id}] upstream dial to {host}:{port} failed: {e}");
                trace.set_state(ConnectionState::UpstreamConnectFailed);
                if let Err(e) = downstream.shutdown().await {
                    log::debug!("[{id}] error closing client socket: {e}");
                }
                return;
            }
        };
        log::debug!("[{id}] upstream connected to {host}:{port}");

        if self.config.role == Role::Client {
            // Mirror of the server role's check: authenticate ourselves to
            // the remote verifier before any tunnel data.
            let token = validator::generate_token(&self.seed);
            if let Err(e) = upstream.write_all(&token).await {
                log::error!("[{id}] failed to present validation token: {e}");
                trace.set_state(ConnectionState::UpstreamConnectFailed);
                return;
            }
        }

        trace.set_state(ConnectionState::UpstreamConnected);
        trace.set_state(ConnectionState::TunnelEstablished);
        log::info!("[{id}] tunnel established");

        // The tunnel-bearing side carries the obfuscated protocol: for the
        // client role that is the upstream leg towards the remote server
        // role, for the server role the inbound leg.
        match self.config.role {
            Role::Client => {
                let tunnel = ObfuscatedStream::new(upstream);
                relay::run(trace, downstream, tunnel, self.config.buffer_size).await;
            }
            Role::Server => {
                let tunnel = ObfuscatedStream::new(downstream);
                relay::run(trace, tunnel, upstream, self.config.buffer_size).await;
            }
        }
    }
}
