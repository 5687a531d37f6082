//! Byte transports: TCP accept/dial, TLS wrapping and full-duplex relay.
//!
//! Everything above this layer talks to a [`BoxStream`], so plaintext and TLS
//! connections are handled the same way once established.

pub mod relay;
pub mod tcp;
pub mod tls;

use std::io;

use http::Uri;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::FetchError;
use crate::request::default_port;
use tls::TlsDialer;

/// Maximum size of a request head we are willing to buffer.
pub const MAX_HEAD_SIZE: usize = 8192;

/// A bidirectional byte stream that can move between tasks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream, either a raw `TcpStream` or a TLS session over one.
pub type BoxStream = Box<dyn AsyncStream>;

/// A fixed peer named by URL: the remote relay, or the fallback site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host without IPv6 brackets, used for dialing and SNI.
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// `host[:port]` as written in the URL, for `Host` headers.
    pub authority: String,
    /// Path component of the URL, `/` when absent.
    pub path: String,
}

impl Endpoint {
    /// Parses an `http://` or `https://` URL.
    pub fn parse(url: &str) -> Result<Self, FetchError> {
        let invalid = || FetchError::InvalidUrl(url.to_string());

        let uri: Uri = url.parse().map_err(|_| invalid())?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid()),
        };
        let authority = uri.authority().ok_or_else(invalid)?;
        let host = authority.host().trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or_else(|| default_port(uri.scheme_str())),
            tls,
            authority: authority.as_str().to_string(),
            path: match uri.path() {
                "" => "/".to_string(),
                path => path.to_string(),
            },
        })
    }

    /// Dials the endpoint, wrapping the connection in TLS when the URL asked for it.
    pub async fn connect(&self, tls: &TlsDialer) -> io::Result<BoxStream> {
        let tcp = tcp::dial((self.host.as_str(), self.port)).await?;
        if self.tls {
            Ok(Box::new(tls.connect(&self.host, tcp).await?))
        } else {
            Ok(Box::new(tcp))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_scheme_port_and_path() {
        let remote = Endpoint::parse("https://relay.example.com").unwrap();
        assert_eq!(remote.host, "relay.example.com");
        assert_eq!(remote.port, 443);
        assert!(remote.tls);
        assert_eq!(remote.path, "/");

        let fallback = Endpoint::parse("http://[::1]:8080/ubuntu/").unwrap();
        assert_eq!(fallback.host, "::1");
        assert_eq!(fallback.port, 8080);
        assert!(!fallback.tls);
        assert_eq!(fallback.authority, "[::1]:8080");
        assert_eq!(fallback.path, "/ubuntu/");
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        assert!(matches!(
            Endpoint::parse("socks5://relay.example.com"),
            Err(FetchError::InvalidUrl(_))
        ));
        assert!(Endpoint::parse("relay.example.com").is_err());
    }
}
