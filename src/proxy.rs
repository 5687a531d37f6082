//! Proxy orchestration.
//!
//! Builds the resolver chain, range indexes and listeners for either role and
//! runs them until the shutdown token is cancelled.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Backend, DnsOverHttps, DohFormat, HostsFile, SystemResolver};
use crate::error::RefreshError;
use crate::fetch::HttpClient;
use crate::ranges::RangeIndex;
use crate::ranges::feed::{self, FeedFilter};
use crate::remote::RemotePeer;
use crate::resolver::Resolver;
use crate::router::{LocalProxy, Router};
use crate::stats::Stats;
use crate::transport::Endpoint;
use crate::transport::tcp::TcpTransport;
use crate::transport::tls::TlsListener;

/// Deadline for DoH queries and feed downloads.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the local proxy.
pub struct LocalConfig {
    /// Local address to bind (e.g., 127.0.0.1:5686)
    pub listen: SocketAddr,
    /// The remote peer every relayed request is sent to
    pub remote: Endpoint,
    pub secret: String,
    pub doh_provider: String,
    pub doh_format: DohFormat,
    /// Replaces DoH answer TTLs when set
    pub static_ttl: Option<Duration>,
    /// Relay everything without resolving or classifying
    pub force_relay: bool,
    pub hosts_file: PathBuf,
    pub feed_url: String,
    pub feed_filter: FeedFilter,
    /// Local copy of the feed used to seed the domestic index
    pub ranges_file: Option<PathBuf>,
    pub refresh_interval: Duration,
}

/// Configuration for the remote peer.
pub struct RemoteConfig {
    pub listen: SocketAddr,
    pub secret: String,
    pub fallback: Endpoint,
    /// Fallback response rate in bytes per second
    pub rate_limit: Option<u64>,
    /// Serve TLS when set, plaintext otherwise
    pub tls: Option<TlsListener>,
}

/// Run the local proxy until `shutdown` is cancelled.
pub async fn run_local(config: LocalConfig, shutdown: CancellationToken) -> io::Result<()> {
    let client = HttpClient::new(FETCH_TIMEOUT);
    let backends: Vec<Box<dyn Backend>> = vec![
        Box::new(HostsFile::new(config.hosts_file.clone())),
        Box::new(DnsOverHttps::new(
            client.clone(),
            config.doh_provider.clone(),
            config.doh_format,
            config.static_ttl,
        )),
        Box::new(SystemResolver),
    ];
    let resolver = Resolver::new(backends);

    let private = Arc::new(RangeIndex::private());
    let domestic = Arc::new(RangeIndex::empty());
    if let Some(path) = &config.ranges_file {
        seed_ranges(path, &domestic, &config.feed_filter).await;
    }

    let transport = TcpTransport::bind(config.listen).await?;
    info!(
        "local proxy listening on {} (remote {}, force_relay={})",
        transport.local_addr()?,
        config.remote.authority,
        config.force_relay
    );

    let stats = Arc::new(Stats::new());
    let router = Router::new(resolver.clone(), private, Arc::clone(&domestic), config.force_relay);
    let proxy = Arc::new(LocalProxy::new(
        router,
        config.remote,
        config.secret,
        Arc::clone(&stats),
    ));

    let accept = transport.start(move |stream, peer| {
        let proxy = Arc::clone(&proxy);
        async move { proxy.serve(stream, peer).await }
    });

    tokio::spawn(refresh_loop(
        client,
        config.feed_url,
        domestic,
        config.feed_filter,
        config.refresh_interval,
        shutdown.clone(),
    ));

    // Print stats every minute
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            interval.tick().await; // Skip first immediate tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.cancelled() => return,
                }
                let snap = stats.snapshot_and_reset();
                info!(
                    "[stats] cache={} requests={} direct={} relayed={} failed={} avg_dial={:.2}ms",
                    resolver.cache_len(),
                    snap.requests,
                    snap.direct,
                    snap.relayed,
                    snap.failed,
                    snap.avg_dial_ms
                );
            }
        }
    });

    shutdown.cancelled().await;
    accept.abort();
    info!("local proxy stopped");

    Ok(())
}

async fn seed_ranges(path: &std::path::Path, index: &RangeIndex, filter: &FeedFilter) {
    let loaded = match feed::load_file(path, filter).await {
        Ok(cidrs) => index.replace(&cidrs).map_err(RefreshError::from),
        Err(e) => Err(e),
    };
    match loaded {
        Ok(count) => info!("loaded {} ranges from {}", count, path.display()),
        Err(e) => warn!("failed to load ranges from {}: {}", path.display(), e),
    }
}

/// Refreshes `index` right away, then once per `every`.
///
/// A failed refresh keeps the previous ranges.
async fn refresh_loop(
    client: HttpClient,
    url: String,
    index: Arc<RangeIndex>,
    filter: FeedFilter,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        if let Err(e) = feed::refresh(&client, &url, &index, &filter, &shutdown).await {
            warn!("range refresh failed, keeping {} ranges: {}", index.len(), e);
        }
    }
}

/// Run the remote peer until `shutdown` is cancelled.
pub async fn run_remote(config: RemoteConfig, shutdown: CancellationToken) -> io::Result<()> {
    let transport = TcpTransport::bind(config.listen).await?;
    info!(
        "remote peer listening on {} ({}, fallback {})",
        transport.local_addr()?,
        if config.tls.is_some() { "tls" } else { "plaintext" },
        config.fallback.authority
    );

    let peer = Arc::new(RemotePeer::new(
        config.secret,
        config.fallback,
        config.rate_limit,
    ));
    let tls = config.tls.map(Arc::new);

    let accept = transport.start(move |stream, from| {
        let peer = Arc::clone(&peer);
        let tls = tls.clone();
        async move {
            match tls {
                Some(tls) => match tls.accept(stream).await {
                    Ok(stream) => peer.serve(Box::new(stream), from).await,
                    Err(e) => warn!("TLS handshake with {} failed: {}", from, e),
                },
                None => peer.serve(Box::new(stream), from).await,
            }
        }
    });

    shutdown.cancelled().await;
    accept.abort();
    info!("remote peer stopped");

    Ok(())
}
