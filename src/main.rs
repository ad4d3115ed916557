//! Socksmux - single-threaded SOCKS5 server
//!
//! This is the main entry point for the Socksmux application.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use socksmux::config::{load_config, DnsMode, ServerConfig};
use socksmux::{Server, ShutdownHandle, NAME, VERSION};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Socksmux - SOCKS5 proxy with CONNECT and UDP ASSOCIATE
#[derive(Parser, Debug)]
#[command(name = "socksmux")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IP address to listen on [default: 0.0.0.0]
    #[arg(long)]
    listen_ip: Option<IpAddr>,

    /// Port to listen on [default: 1080]
    #[arg(long)]
    listen_port: Option<u16>,

    /// Username required from clients
    #[arg(long)]
    username: Option<String>,

    /// Password required from clients
    #[arg(long)]
    password: Option<String>,

    /// DNS server: auto, none or an IP address [default: auto]
    #[arg(long)]
    dns_ip: Option<DnsMode>,

    /// DNS server port [default: 53]
    #[arg(long)]
    dns_port: Option<u16>,

    /// Set TCP_NODELAY on client connections
    #[arg(long)]
    client_tcp_nodelay: bool,

    /// Set SO_KEEPALIVE on client connections
    #[arg(long)]
    client_tcp_keepalive: bool,

    /// Set TCP_NODELAY on remote connections
    #[arg(long)]
    remote_tcp_nodelay: bool,

    /// Set SO_KEEPALIVE on remote connections
    #[arg(long)]
    remote_tcp_keepalive: bool,

    /// Log level (off, error, warning, info, debug, trace)
    #[arg(short, long, default_value = "off")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    let config = build_config(&args)?;

    info!("{} v{}", NAME, VERSION);
    if let Some(path) = &args.config {
        info!("Configuration loaded from: {:?}", path);
    }

    let mut server = Server::bind(config)?;
    let handle = server.shutdown_handle();

    tokio::spawn(wait_for_shutdown(handle));

    tokio::task::spawn_blocking(move || server.serve())
        .await
        .context("Server task failed")?
}

/// Merge the optional config file with command line flags
fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?.server,
        None => ServerConfig::default(),
    };

    if let Some(ip) = args.listen_ip {
        config.listen_ip = ip;
    }
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(username) = &args.username {
        config.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    if let Some(dns) = args.dns_ip {
        config.dns = dns;
    }
    if let Some(port) = args.dns_port {
        config.dns_port = port;
    }
    config.client_tcp.nodelay |= args.client_tcp_nodelay;
    config.client_tcp.keepalive |= args.client_tcp_keepalive;
    config.remote_tcp.nodelay |= args.remote_tcp_nodelay;
    config.remote_tcp.keepalive |= args.remote_tcp_keepalive;

    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

/// Trigger shutdown on Ctrl+C or SIGTERM
async fn wait_for_shutdown(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }

    handle.shutdown();
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "off" | "none" => return Ok(()),
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(anyhow!("Unknown log level: {}", other)),
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
