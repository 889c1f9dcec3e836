use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waypoint::config;
use waypoint::server::{ProxyConfig, ProxyServer};
use waypoint::upstream::{HickoryUpstream, Upstream};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Rule-driven DNS interception proxy", long_about = None)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Bind address for the DNS listeners
    #[arg(short, long, default_value = "127.0.0.1")]
    bind: IpAddr,

    /// Upstream nameserver (host:port); the system resolver when omitted
    #[arg(short, long)]
    upstream: Option<SocketAddr>,

    /// Also serve DNS over TCP
    #[arg(long)]
    tcp: bool,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let rules = config::load(&args.config);
    info!(
        config = %args.config.display(),
        rules = rules.rules().len(),
        dns_port = rules.dns_port(),
        "configuration loaded"
    );

    let upstream: Arc<dyn Upstream> = match args.upstream {
        Some(addr) => Arc::new(HickoryUpstream::with_nameserver(addr)),
        None => Arc::new(
            HickoryUpstream::from_system().context("reading system resolver configuration")?,
        ),
    };

    let mut server = ProxyServer::new(
        rules,
        upstream,
        ProxyConfig {
            bind_ip: args.bind,
            enable_tcp: args.tcp,
            config_path: Some(args.config),
        },
    );
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.stop().await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}
