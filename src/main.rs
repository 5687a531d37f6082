use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use misha::backend::{DEFAULT_HOSTS_PATH, DohFormat};
use misha::proxy::{self, LocalConfig, RemoteConfig};
use misha::ranges::feed::{DEFAULT_FEED_URL, FeedFilter, Family};
use misha::remote::{DEFAULT_FALLBACK_URL, DEFAULT_RATE_LIMIT};
use misha::transport::Endpoint;
use misha::transport::tls::TlsListener;

#[derive(Parser)]
#[command(name = "misha")]
#[command(about = "Split-routing HTTP proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local forward proxy
    Local(LocalArgs),
    /// Run the remote relay peer
    Remote(RemoteArgs),
}

#[derive(Args)]
struct LocalArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:5686")]
    listen: SocketAddr,

    /// URL of the remote peer
    #[arg(long, default_value = "https://yourdomain.com")]
    remote: String,

    /// DNS-over-HTTPS endpoint
    #[arg(long, default_value = "https://doh.360.cn/dns-query")]
    doh_provider: String,

    /// DNS-over-HTTPS request style
    #[arg(long, value_enum, default_value_t = DohStyle::Json)]
    doh_format: DohStyle,

    /// TTL that replaces DoH answer TTLs, 0 keeps the answer's own
    #[arg(long, default_value_t = 86400)]
    static_ttl_secs: u64,

    /// Relay every request through the remote peer
    #[arg(long)]
    force_relay: bool,

    /// Shared secret expected by the remote peer
    #[arg(long, default_value = "<your secret key>")]
    secret: String,

    /// Hours between range feed refreshes
    #[arg(long, default_value_t = 24)]
    refresh_hours: u64,

    /// Country whose ranges are reached directly
    #[arg(long, default_value = "CN")]
    country: String,

    /// Range feed URL
    #[arg(long, default_value = DEFAULT_FEED_URL)]
    feed_url: String,

    /// Local copy of the range feed loaded at startup
    #[arg(long)]
    ranges_file: Option<PathBuf>,

    /// Hosts file consulted before DNS
    #[arg(long, default_value = DEFAULT_HOSTS_PATH)]
    hosts_file: PathBuf,

    /// Only load IPv4 ranges
    #[arg(long)]
    no_ipv6_ranges: bool,
}

#[derive(Args)]
struct RemoteArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: SocketAddr,

    /// Shared secret required from local proxies
    #[arg(long, default_value = "<your secret key>")]
    secret: String,

    /// Website served to requests without the secret
    #[arg(long, default_value = DEFAULT_FALLBACK_URL)]
    fallback_url: String,

    /// Fallback response rate in bytes/s, 0 disables
    #[arg(long, default_value_t = DEFAULT_RATE_LIMIT)]
    rate_limit: u64,

    /// PEM certificate chain; serves plaintext without it
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum DohStyle {
    Json,
    Wire,
}

impl From<DohStyle> for DohFormat {
    fn from(style: DohStyle) -> Self {
        match style {
            DohStyle::Json => DohFormat::Json,
            DohStyle::Wire => DohFormat::Wire,
        }
    }
}

fn local_config(args: LocalArgs) -> Result<LocalConfig> {
    let remote = Endpoint::parse(&args.remote).context("invalid --remote")?;
    let families = if args.no_ipv6_ranges {
        vec![Family::V4]
    } else {
        vec![Family::V4, Family::V6]
    };

    Ok(LocalConfig {
        listen: args.listen,
        remote,
        secret: args.secret,
        doh_provider: args.doh_provider,
        doh_format: args.doh_format.into(),
        static_ttl: (args.static_ttl_secs > 0).then(|| Duration::from_secs(args.static_ttl_secs)),
        force_relay: args.force_relay,
        hosts_file: args.hosts_file,
        feed_url: args.feed_url,
        feed_filter: FeedFilter::new(args.country, families),
        ranges_file: args.ranges_file,
        refresh_interval: Duration::from_secs(args.refresh_hours.max(1) * 3600),
    })
}

fn remote_config(args: RemoteArgs) -> Result<RemoteConfig> {
    let fallback = Endpoint::parse(&args.fallback_url).context("invalid --fallback-url")?;
    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(
            TlsListener::from_pem(cert, key)
                .with_context(|| format!("failed to load TLS files {}", cert.display()))?,
        ),
        _ => None,
    };

    Ok(RemoteConfig {
        listen: args.listen,
        secret: args.secret,
        fallback,
        rate_limit: (args.rate_limit > 0).then_some(args.rate_limit),
        tls,
    })
}

async fn run(cli: Cli) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, shutting down"),
                Err(e) => warn!("failed to listen for interrupt: {}", e),
            }
            shutdown.cancel();
        }
    });

    match cli.command {
        Command::Local(args) => {
            let config = local_config(args)?;
            let listen = config.listen;
            proxy::run_local(config, shutdown)
                .await
                .with_context(|| format!("local proxy on {listen}"))
        }
        Command::Remote(args) => {
            let config = remote_config(args)?;
            let listen = config.listen;
            proxy::run_remote(config, shutdown)
                .await
                .with_context(|| format!("remote peer on {listen}"))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(cli))
}
