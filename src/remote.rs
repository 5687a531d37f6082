//! The remote peer.
//!
//! Requests carrying the shared secret are tunnelled to their real
//! destination. Anything else is passed to a fixed public website, so the
//! peer looks like an ordinary reverse proxy to a casual observer.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::request::{self, RequestHead, SECRET_HEADER};
use crate::transport::relay::relay_limited;
use crate::transport::tcp::dial;
use crate::transport::tls::TlsDialer;
use crate::transport::{BoxStream, Endpoint};

/// Default fallback website.
pub const DEFAULT_FALLBACK_URL: &str = "https://mirror.pilotfiber.com/ubuntu/";

/// Default downstream rate for fallback responses, in bytes per second.
pub const DEFAULT_RATE_LIMIT: u64 = 20 * 1024;

/// How a request is served, decided by the secret header alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Tunnel to the destination named by the request.
    Authenticated,
    /// Reverse-proxy to the fallback website.
    Public,
}

impl Dispatch {
    /// The header must be present and match `secret` exactly.
    pub fn of(head: &RequestHead, secret: &str) -> Self {
        match head.header_bytes(SECRET_HEADER) {
            Some(value) if value == secret.as_bytes() => Dispatch::Authenticated,
            _ => Dispatch::Public,
        }
    }
}

pub struct RemotePeer {
    secret: String,
    fallback: Endpoint,
    rate_limit: Option<u64>,
    tls: TlsDialer,
}

impl RemotePeer {
    /// `rate_limit` caps fallback responses in bytes per second.
    pub fn new(secret: String, fallback: Endpoint, rate_limit: Option<u64>) -> Self {
        Self {
            secret,
            fallback,
            rate_limit,
            tls: TlsDialer::new(),
        }
    }

    /// Serves one connection from a local proxy or any other client.
    pub async fn serve(&self, mut stream: BoxStream, peer: SocketAddr) {
        let (upstream, limit) = match self.open(&mut stream, peer).await {
            Ok(Some(opened)) => opened,
            Ok(None) => return,
            Err(e) => {
                debug!("{}: {}", peer, e);
                if let Some(response) = request::error_response(&e) {
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                }
                return;
            }
        };

        let moved = relay_limited(stream, upstream, limit).await;
        debug!(
            "{}: relay done, {} bytes up, {} bytes down",
            peer, moved.client_to_upstream, moved.upstream_to_client
        );
    }

    async fn open(
        &self,
        stream: &mut BoxStream,
        peer: SocketAddr,
    ) -> Result<Option<(BoxStream, Option<u64>)>, ProxyError> {
        let Some((head, leftover)) = request::read_head(stream).await? else {
            return Ok(None);
        };

        let (mut upstream, head, limit) = match Dispatch::of(&head, &self.secret) {
            Dispatch::Authenticated => {
                let (upstream, head) = self.open_tunnel(stream, head, peer).await?;
                (upstream, head, None)
            }
            Dispatch::Public => {
                let (upstream, head) = self.open_fallback(head, peer).await?;
                (upstream, Some(head), self.rate_limit)
            }
        };

        if let Some(head) = head {
            upstream.write_all(&head.to_bytes()).await?;
        }
        if !leftover.is_empty() {
            upstream.write_all(&leftover).await?;
        }

        Ok(Some((upstream, limit)))
    }

    /// Dials the requested destination. Returns the head still to be
    /// forwarded, or `None` when a `CONNECT` was answered here.
    async fn open_tunnel(
        &self,
        stream: &mut BoxStream,
        mut head: RequestHead,
        peer: SocketAddr,
    ) -> Result<(BoxStream, Option<RequestHead>), ProxyError> {
        head.remove_header(SECRET_HEADER);
        let target = head.destination()?;

        let upstream = dial((target.host.as_str(), target.port))
            .await
            .map_err(|source| ProxyError::Dial {
                addr: target.authority(),
                source,
            })?;
        info!("{} <-> remote <-> {}", peer, target.authority());

        if head.is_connect() {
            stream
                .write_all(&request::connect_established(head.proto()))
                .await?;
            return Ok((Box::new(upstream), None));
        }

        head.to_origin_form();
        Ok((Box::new(upstream), Some(head)))
    }

    async fn open_fallback(
        &self,
        mut head: RequestHead,
        peer: SocketAddr,
    ) -> Result<(BoxStream, RequestHead), ProxyError> {
        if head.is_connect() {
            return Err(ProxyError::BadRequest("CONNECT not supported".to_string()));
        }

        head.to_origin_form();
        head.target = join_target(&self.fallback.path, &head.target);
        head.set_header("Host", &self.fallback.authority);
        head.set_header("Connection", "close");
        head.remove_header("Proxy-Connection");
        head.remove_header(SECRET_HEADER);
        let mut forwarded = match head.header_bytes("X-Forwarded-For") {
            Some(prior) => [prior, &b", "[..]].concat(),
            None => Vec::new(),
        };
        forwarded.extend_from_slice(peer.ip().to_string().as_bytes());
        head.set_header_bytes("X-Forwarded-For", &forwarded);

        let upstream = self
            .fallback
            .connect(&self.tls)
            .await
            .map_err(|source| ProxyError::Dial {
                addr: self.fallback.authority.clone(),
                source,
            })?;
        debug!("{} -> fallback {}{}", peer, self.fallback.authority, head.target);

        Ok((upstream, head))
    }
}

/// Appends an origin-form request target to the fallback's base path.
fn join_target(base: &str, target: &str) -> String {
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    };

    let mut joined = match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    };
    if let Some(query) = query {
        joined.push('?');
        joined.push_str(query);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpTransport;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    const SECRET: &str = "s3cret";

    fn head(raw: &str) -> RequestHead {
        let mut bytes = raw.as_bytes();
        futures::executor::block_on(request::read_head(&mut bytes))
            .unwrap()
            .unwrap()
            .0
    }

    async fn start_peer(fallback: &str) -> SocketAddr {
        let peer = Arc::new(RemotePeer::new(
            SECRET.to_string(),
            Endpoint::parse(fallback).unwrap(),
            Some(DEFAULT_RATE_LIMIT),
        ));
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        transport.start(move |stream, from| {
            let peer = Arc::clone(&peer);
            async move { peer.serve(Box::new(stream), from).await }
        });
        addr
    }

    /// Accepts one connection, records its head and answers with `reply`.
    fn upstream_once(
        listener: TcpListener,
        reply: &'static [u8],
    ) -> tokio::task::JoinHandle<RequestHead> {
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (head, _) = request::read_head(&mut stream).await.unwrap().unwrap();
            stream.write_all(reply).await.unwrap();
            head
        })
    }

    #[test]
    fn dispatch_needs_exact_secret() {
        let none = head("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        let wrong = head("GET / HTTP/1.1\r\nHost: a\r\nMisha-Secret: S3CRET\r\n\r\n");
        let right = head("GET / HTTP/1.1\r\nHost: a\r\nmisha-secret: s3cret\r\n\r\n");

        assert_eq!(Dispatch::of(&none, SECRET), Dispatch::Public);
        assert_eq!(Dispatch::of(&wrong, SECRET), Dispatch::Public);
        assert_eq!(Dispatch::of(&right, SECRET), Dispatch::Authenticated);
        assert_eq!(Dispatch::of(&none, ""), Dispatch::Public);
    }

    #[test]
    fn join_target_handles_slashes_and_query() {
        assert_eq!(join_target("/ubuntu/", "/dists/"), "/ubuntu/dists/");
        assert_eq!(join_target("/ubuntu", "/dists"), "/ubuntu/dists");
        assert_eq!(join_target("/", "/"), "/");
        assert_eq!(join_target("/ubuntu/", "/ls?x=1"), "/ubuntu/ls?x=1");
        assert_eq!(join_target("/ubuntu", "*"), "/ubuntu/*");
    }

    #[tokio::test]
    async fn authenticated_request_reaches_destination_without_secret() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();
        let seen = upstream_once(destination, b"HTTP/1.1 204 No Content\r\n\r\n");
        let fallback = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = start_peer(&format!("http://{}/ubuntu/", fallback.local_addr().unwrap())).await;

        let mut client = TcpStream::connect(peer).await.unwrap();
        client
            .write_all(format!("GET /x HTTP/1.1\r\nHost: {dest_addr}\r\nMisha-Secret: {SECRET}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let head = seen.await.unwrap();
        assert_eq!(head.target, "/x");
        assert_eq!(head.header(SECRET_HEADER), None);
        assert_eq!(response, b"HTTP/1.1 204 No Content\r\n\r\n");
    }

    #[tokio::test]
    async fn authenticated_connect_is_answered_and_tunnelled() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = destination.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = destination.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });
        let peer = start_peer("http://127.0.0.1:9/").await;

        let mut client = TcpStream::connect(peer).await.unwrap();
        client
            .write_all(format!("CONNECT {dest_addr} HTTP/1.1\r\nMisha-Secret: {SECRET}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut reply = [0u8; 19];
        client.read_exact(&mut reply).await.unwrap();
        client.write_all(b"pong").await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();

        assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(echoed, b"pong");
    }

    #[tokio::test]
    async fn public_request_goes_to_fallback_site() {
        let fallback = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fallback_addr = fallback.local_addr().unwrap();
        let seen = upstream_once(fallback, b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nmirror");
        let peer = start_peer(&format!("http://{fallback_addr}/ubuntu/")).await;

        let mut client = TcpStream::connect(peer).await.unwrap();
        client
            .write_all(b"GET /dists/?C=M HTTP/1.1\r\nHost: relay.example.com\r\nMisha-Secret: guess\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        let head = seen.await.unwrap();
        assert_eq!(head.target, "/ubuntu/dists/?C=M");
        assert_eq!(head.header("Host"), Some(fallback_addr.to_string().as_str()));
        assert_eq!(head.header("Connection"), Some("close"));
        assert_eq!(head.header("X-Forwarded-For"), Some("127.0.0.1"));
        assert_eq!(head.header(SECRET_HEADER), None);
        assert!(response.ends_with(b"mirror"));
    }

    #[tokio::test]
    async fn public_connect_is_rejected() {
        let peer = start_peer("http://127.0.0.1:9/").await;

        let mut client = TcpStream::connect(peer).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        assert!(response.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn unreachable_destination_is_service_unavailable() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);
        let peer = start_peer("http://127.0.0.1:9/").await;

        let mut client = TcpStream::connect(peer).await.unwrap();
        client
            .write_all(format!("CONNECT {closed_addr} HTTP/1.1\r\nMisha-Secret: {SECRET}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        assert!(response.starts_with(b"HTTP/1.1 503 Service Unavailable\r\n"));
    }
}
