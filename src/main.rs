//! Portshade - Obfuscating TCP Tunnel Proxy
//!
//! Wraps TCP connections in a keyed obfuscation layer between a client-role
//! and a server-role process that share a secret seed file.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use portshade::{Env, ProxyConfig, Role, Seed, Server, Statistics};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "portshade")]
#[command(version = VERSION)]
#[command(about = "Obfuscating TCP Tunnel Proxy", long_about = None)]
struct Cli {
    /// Configuration file path (overridden by subcommand options)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client role (wraps local traffic into obfuscated tunnels)
    Client {
        /// Local listen address
        #[arg(short, long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,

        /// Remote server-role endpoint as host:port
        #[arg(short, long)]
        upstream: String,

        /// Root directory for the seed and persisted statistics
        #[arg(short, long, default_value = "portshade")]
        root: PathBuf,
    },

    /// Run the server role (validates and unwraps inbound tunnels)
    Server {
        /// Listen address for inbound tunnels
        #[arg(short, long, default_value = "0.0.0.0:8443")]
        listen: SocketAddr,

        /// Real upstream service as host:port
        #[arg(short, long)]
        upstream: String,

        /// Root directory for the seed and persisted statistics
        #[arg(short, long, default_value = "portshade")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let config = build_config(&cli)?;
    config.validate().context("invalid configuration")?;

    info!("portshade {VERSION}");
    run(config).await
}

fn build_config(cli: &Cli) -> Result<ProxyConfig> {
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ProxyConfig::default(),
    };

    match &cli.command {
        Some(Commands::Client {
            listen,
            upstream,
            root,
        }) => {
            let (host, port) = parse_host_port(upstream)?;
            config.role = Role::Client;
            config.listen = *listen;
            config.upstream_host = host;
            config.upstream_port = port;
            config.root = root.clone();
        }
        Some(Commands::Server {
            listen,
            upstream,
            root,
        }) => {
            let (host, port) = parse_host_port(upstream)?;
            config.role = Role::Server;
            config.listen = *listen;
            config.upstream_host = host;
            config.upstream_port = port;
            config.root = root.clone();
        }
        None => {
            if cli.config.is_none() {
                bail!("either a subcommand or a --config file is required");
            }
        }
    }

    Ok(config)
}

fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("upstream address must be host:port, got {addr:?}");
    };
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid upstream port in {addr:?}"))?;
    Ok((host.to_string(), port))
}

async fn run(config: ProxyConfig) -> Result<()> {
    let env = Env::new(&config.root);
    let seed = Arc::new(Seed::load(&env).context("failed to load seed")?);
    let stats = Statistics::load(&env).context("failed to load statistics")?;
    let autosave = stats.spawn_autosave(env.clone(), config.save_interval);

    let config = Arc::new(config);
    let server = Server::new(Arc::clone(&config), seed, Arc::clone(&stats));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("listener failed: {e}");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    autosave.abort();
    stats.save(&env).context("failed to persist statistics")?;
    info!(
        "served {} connections this session ({} established, {} failed)",
        stats.connection_count(),
        stats.success_connection_count(),
        stats.failed_connection_count()
    );
    Ok(())
}
