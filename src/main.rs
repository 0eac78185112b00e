//! dnsveil - covert tunnel client over recursive DNS resolvers.
//!
//! Binds a local TCP endpoint and carries everything it accepts through
//! TXT queries against the configured resolver.

use anyhow::{Context, Result};
use clap::Parser;
use dnsveil::{local_lan_addresses, ClientConfig, TunnelClient};
use log::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "dnsveil")]
#[command(version = VERSION)]
#[command(about = "Covert tunnel client over recursive DNS resolvers", long_about = None)]
struct Cli {
    /// Recursive resolver to speak to (host or host:port, port defaults to 53)
    #[arg(short, long)]
    dns_server: String,

    /// Tunnel domain: the authoritative zone terminating the tunnel
    #[arg(short = 'D', long)]
    domain: String,

    /// Server X25519 public key, 64 hex characters
    #[arg(short, long, env = "DNSVEIL_PUBKEY")]
    pubkey: String,

    /// Local listen address handed to the application
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: String,

    /// Share the local proxy on the LAN (rewrites 127.0.0.1 to 0.0.0.0)
    #[arg(long)]
    share_proxy: bool,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose >= 3 {
        logger.filter_module("dnsveil", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }
    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    info!("dnsveil {} ({} {})", VERSION, GIT_HASH, BUILD_DATE);

    let config = ClientConfig {
        dns_server: cli.dns_server,
        tunnel_domain: cli.domain,
        server_pubkey: cli.pubkey,
        listen_addr: cli.listen,
        share_proxy: cli.share_proxy,
    };
    let client = TunnelClient::from_config(&config).context("invalid configuration")?;

    client.start().await.context("failed to start tunnel")?;
    if let Some(addr) = client.listen_addr() {
        info!("listening on {}", addr);
        if config.share_proxy {
            let lan = local_lan_addresses();
            if !lan.is_empty() {
                info!("proxy reachable on the LAN via {} (port {})", lan, addr.port());
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    info!("shutting down");
    client.stop().await;
    Ok(())
}
