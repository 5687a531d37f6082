//! Minimal outbound HTTP/1.1 GET client.
//!
//! Used for DNS-over-HTTPS queries and for downloading the range feed. Each
//! request opens its own connection, plaintext or TLS by URL scheme.

use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::FetchError;
use crate::transport::BoxStream;
use crate::transport::tcp::dial;
use crate::transport::tls::TlsDialer;

const CLIENT_NAME: &str = concat!("misha/", env!("CARGO_PKG_VERSION"));

/// One-shot HTTP GET client with a per-request deadline.
#[derive(Clone)]
pub struct HttpClient {
    tls: TlsDialer,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tls: TlsDialer::new(),
            timeout,
        }
    }

    /// Fetches `url` and returns the body of a 2xx response.
    pub async fn get(&self, url: &str, headers: &[(&str, &str)]) -> Result<Bytes, FetchError> {
        tokio::time::timeout(self.timeout, self.get_inner(url, headers))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn get_inner(&self, url: &str, headers: &[(&str, &str)]) -> Result<Bytes, FetchError> {
        let uri: Uri = url
            .parse()
            .map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(FetchError::InvalidUrl(url.to_string())),
        };
        let host = uri
            .host()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let dial_host = host.trim_start_matches('[').trim_end_matches(']');

        let tcp = dial((dial_host, port))
            .await
            .map_err(|source| FetchError::Connect {
                host: format!("{host}:{port}"),
                source,
            })?;
        let stream: BoxStream = if tls {
            Box::new(
                self.tls
                    .connect(dial_host, tcp)
                    .await
                    .map_err(FetchError::TlsHandshake)?,
            )
        } else {
            Box::new(tcp)
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("HTTP client connection ended: {}", e);
            }
        });

        let authority = uri.authority().map(|a| a.as_str()).unwrap_or(host);
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut builder = Request::get(path)
            .header(HOST, authority)
            .header(USER_AGENT, CLIENT_NAME);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        Ok(response.into_body().collect().await?.to_bytes())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response per connection and hands back the
    /// request heads it saw.
    pub(crate) async fn serve_canned(
        status: &'static str,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
                    let response = format!(
                        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(&body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (format!("http://{addr}"), rx)
    }

    #[tokio::test]
    async fn get_returns_body_and_sends_headers() {
        let (base, mut heads) = serve_canned("200 OK", "text/plain", b"hello".to_vec()).await;
        let client = HttpClient::new(Duration::from_secs(5));

        let body = client
            .get(&format!("{base}/path?x=1"), &[("Accept", "text/plain")])
            .await
            .unwrap();

        assert_eq!(&body[..], b"hello");
        let head = heads.recv().await.unwrap();
        assert!(head.starts_with("GET /path?x=1 HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains("accept: text/plain"));
        assert!(head.to_ascii_lowercase().contains("host: 127.0.0.1:"));
    }

    #[tokio::test]
    async fn get_non_success_status_is_error() {
        let (base, _heads) = serve_canned("404 Not Found", "text/plain", Vec::new()).await;
        let client = HttpClient::new(Duration::from_secs(5));

        let err = client.get(&base, &[]).await.unwrap_err();

        assert!(matches!(err, FetchError::Status(s) if s.as_u16() == 404));
    }

    #[tokio::test]
    async fn get_rejects_unknown_scheme() {
        let client = HttpClient::new(Duration::from_secs(5));

        let err = client.get("ftp://example.com/file", &[]).await.unwrap_err();

        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn get_connection_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = HttpClient::new(Duration::from_secs(5));

        let err = client.get(&format!("http://{addr}/"), &[]).await.unwrap_err();

        assert!(matches!(err, FetchError::Connect { .. }));
    }
}
