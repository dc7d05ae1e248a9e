//! Portshade: Obfuscating TCP Tunnel Proxy
//!
//! Portshade relays TCP connections through an obfuscated tunnel between a
//! client-role process and a server-role process that share a secret seed
//! file. The client accepts plain application traffic and wraps it; the
//! server validates every inbound connection against the seed before it
//! pairs the tunnel with the real upstream service. Unvalidated peers see a
//! silent socket that closes after a random delay.
//!
//! ## Quick Start
//!
//! ```bash
//! # Near the application: wrap traffic and forward to the remote server
//! portshade client --listen 127.0.0.1:7070 --upstream vps.example.com:8443
//!
//! # Near the service: validate, unwrap and forward to the real upstream
//! portshade server --listen 0.0.0.0:8443 --upstream 127.0.0.1:22
//! ```
//!
//! Both processes must use the same `seed` file (copy it from whichever
//! side generated it first).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────┐  obfuscated  ┌───────────┐     ┌──────────┐
//! │ Application │────▶│ portshade │─────────────▶│ portshade │────▶│ Upstream │
//! │             │     │  client   │    tunnel    │  server   │     │ service  │
//! └─────────────┘     └───────────┘              └───────────┘     └──────────┘
//!                           └───────── shared seed file ─────┘
//! ```

pub mod config;
pub mod connection;
pub mod env;
pub mod obfuscate;
pub mod relay;
pub mod seed;
pub mod server;
pub mod state;
pub mod stats;
pub mod trace;
pub mod validator;

// Re-export core types
pub use config::{ProxyConfig, Role};
pub use connection::{Connection, ConnectionContext};
pub use env::Env;
pub use obfuscate::ObfuscatedStream;
pub use seed::Seed;
pub use server::Server;
pub use state::{ConnectionState, Direction};
pub use stats::Statistics;
pub use trace::{ConnectionId, TraceInfo, TraceObserver};

/// Portshade error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed or truncated seed file
    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    /// JSON persistence error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration file serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Attempt to overwrite a write-once trace field
    #[error("Trace field already set: {0}")]
    ImmutableTrace(&'static str),
}
