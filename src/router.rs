//! Per-request path selection and the local proxy's connection handling.
//!
//! Every accepted client goes through
//! `read head -> classify -> dial (direct or relay) -> relay bytes`.
//! Failures before the relay starts are answered with a canned error
//! response; nothing is retried.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::request::{self, SECRET_HEADER, Target};
use crate::ranges::RangeIndex;
use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::transport::relay::relay;
use crate::transport::tcp::dial;
use crate::transport::tls::TlsDialer;
use crate::transport::{BoxStream, Endpoint};

/// Which way a request leaves the local proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Direct,
    Relay,
}

/// The routing decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingOutcome {
    /// Resolved destination. `None` only when classification was skipped.
    pub address: Option<IpAddr>,
    pub path: PathKind,
}

/// Chooses between dialing a destination directly and tunnelling it.
pub struct Router {
    resolver: Resolver,
    private: Arc<RangeIndex>,
    domestic: Arc<RangeIndex>,
    force_relay: bool,
}

impl Router {
    pub fn new(
        resolver: Resolver,
        private: Arc<RangeIndex>,
        domestic: Arc<RangeIndex>,
        force_relay: bool,
    ) -> Self {
        Self {
            resolver,
            private,
            domestic,
            force_relay,
        }
    }

    /// Decides the path for `target`.
    ///
    /// Private and domestic addresses go direct, everything else is relayed.
    /// With `force_relay` set nothing is resolved or classified.
    pub async fn route(&self, target: &Target) -> Result<RoutingOutcome, ProxyError> {
        if self.force_relay {
            return Ok(RoutingOutcome {
                address: None,
                path: PathKind::Relay,
            });
        }

        let ip = match target.literal_ip() {
            Some(ip) => ip,
            None => self
                .resolver
                .lookup(&target.host)
                .await
                .ip
                .ok_or_else(|| ProxyError::NoSuchHost(target.host.clone()))?,
        };

        let path = if self.private.contains(ip) || self.domestic.contains(ip) {
            PathKind::Direct
        } else {
            PathKind::Relay
        };

        Ok(RoutingOutcome {
            address: Some(ip),
            path,
        })
    }
}

/// The local HTTP forward proxy.
pub struct LocalProxy {
    router: Router,
    remote: Endpoint,
    secret: String,
    tls: TlsDialer,
    stats: Arc<Stats>,
}

impl LocalProxy {
    pub fn new(router: Router, remote: Endpoint, secret: String, stats: Arc<Stats>) -> Self {
        Self {
            router,
            remote,
            secret,
            tls: TlsDialer::new(),
            stats,
        }
    }

    /// Serves one client connection to completion.
    pub async fn serve<C>(&self, mut client: C, peer: SocketAddr)
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let upstream = match self.open(&mut client, peer).await {
            Ok(Some((upstream, path, dial_time))) => {
                match path {
                    PathKind::Direct => self.stats.record_direct(dial_time),
                    PathKind::Relay => self.stats.record_relayed(dial_time),
                }
                upstream
            }
            Ok(None) => return,
            Err(e) => {
                self.stats.record_failed();
                debug!("{}: {}", peer, e);
                if let Some(response) = request::error_response(&e) {
                    let _ = client.write_all(&response).await;
                    let _ = client.shutdown().await;
                }
                return;
            }
        };

        let moved = relay(client, upstream).await;
        debug!(
            "{}: relay done, {} bytes up, {} bytes down",
            peer, moved.client_to_upstream, moved.upstream_to_client
        );
    }

    /// Reads the request, routes it and opens the upstream connection.
    ///
    /// On success everything that must precede the tunnel has been written:
    /// the `CONNECT` reply to the client, or the request head to the upstream.
    async fn open<C>(
        &self,
        client: &mut C,
        peer: SocketAddr,
    ) -> Result<Option<(BoxStream, PathKind, Duration)>, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Some((mut head, leftover)) = request::read_head(client).await? else {
            return Ok(None);
        };
        let target = head.destination()?;
        let outcome = self.router.route(&target).await?;

        let started = Instant::now();
        let (mut upstream, path, dial_time) = match (outcome.path, outcome.address) {
            (PathKind::Direct, Some(ip)) => {
                let upstream = self.dial_direct(&target, ip).await?;
                let dial_time = started.elapsed();
                info!("{} <-> local <-> {}({})", peer, target.host, ip);

                if head.is_connect() {
                    client
                        .write_all(&request::connect_established(head.proto()))
                        .await?;
                } else {
                    head.fold_proxy_connection();
                    head.to_origin_form();
                }
                (upstream, PathKind::Direct, dial_time)
            }
            (_, address) => {
                let upstream = self.dial_relay().await?;
                let dial_time = started.elapsed();
                match address {
                    Some(ip) => info!("{} <-> local <-> remote <-> {}({})", peer, target.host, ip),
                    None => info!("{} <-> local <-> remote <-> {}", peer, target.host),
                }

                head.to_origin_form();
                head.set_header(SECRET_HEADER, &self.secret);
                (upstream, PathKind::Relay, dial_time)
            }
        };

        // a direct CONNECT is answered locally; everything else goes upstream
        if path == PathKind::Relay || !head.is_connect() {
            upstream.write_all(&head.to_bytes()).await?;
        }
        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }

        Ok(Some((upstream, path, dial_time)))
    }

    async fn dial_direct(&self, target: &Target, ip: IpAddr) -> Result<BoxStream, ProxyError> {
        let addr = SocketAddr::new(ip, target.port);
        let upstream = dial(addr).await.map_err(|source| ProxyError::Dial {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Box::new(upstream))
    }

    async fn dial_relay(&self) -> Result<BoxStream, ProxyError> {
        self.remote
            .connect(&self.tls)
            .await
            .map_err(|source| ProxyError::Dial {
                addr: self.remote.authority.clone(),
                source,
            })
    }
}
