//! HTTP/1.x request heads: reading, target extraction and re-serialization.
//!
//! Only the head is parsed. Whatever follows it (a request body, or the first
//! bytes of a tunnelled stream) is handed back untouched and forwarded before
//! the relay takes over.

use std::net::IpAddr;

use http::Uri;
use http::uri::Authority;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProxyError;
use crate::transport::MAX_HEAD_SIZE;

/// Header carrying the shared secret between the local proxy and its remote peer.
pub const SECRET_HEADER: &str = "Misha-Secret";

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 2048;

/// A parsed request line plus headers, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// The request-target exactly as received (origin, absolute or authority form).
    pub target: String,
    /// Minor HTTP version: `0` or `1`.
    pub version: u8,
    /// Header values are kept as received; they need not be UTF-8.
    pub headers: Vec<(String, Vec<u8>)>,
}

/// Where a request wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or address literal, without IPv6 brackets.
    pub host: String,
    pub port: u16,
}

impl Target {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// The host as an address, when it is already a literal.
    pub fn literal_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

/// Default port for a URI scheme.
pub fn default_port(scheme: Option<&str>) -> u16 {
    match scheme {
        Some("https") => 443,
        _ => 80,
    }
}

fn parse_authority(authority: &str, scheme: Option<&str>) -> Result<Target, ProxyError> {
    let parsed: Authority = authority
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("invalid host {authority:?}")))?;

    let host = parsed.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ProxyError::BadRequest(format!("invalid host {authority:?}")));
    }

    Ok(Target {
        host: host.to_string(),
        port: parsed.port_u16().unwrap_or_else(|| default_port(scheme)),
    })
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Protocol token for a status line, e.g. `HTTP/1.1`.
    pub fn proto(&self) -> &'static str {
        if self.version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header_bytes(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Like [`header_bytes`](Self::header_bytes), but only for UTF-8 values.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_bytes(name)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.set_header_bytes(name, value.as_bytes());
    }

    /// Replaces every value of `name` with a single `value`.
    pub fn set_header_bytes(&mut self, name: &str, value: &[u8]) {
        match self.headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.headers[pos].1 = value.to_vec();
                let mut idx = 0;
                self.headers.retain(|(n, _)| {
                    idx += 1;
                    idx - 1 == pos || !n.eq_ignore_ascii_case(name)
                });
            }
            None => self.headers.push((name.to_string(), value.to_vec())),
        }
    }

    /// Drops every value of `name`, returning the first one.
    pub fn remove_header(&mut self, name: &str) -> Option<Vec<u8>> {
        let first = self.header_bytes(name).map(<[u8]>::to_vec);
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        first
    }

    /// Moves a client's `Proxy-Connection` value into `Connection`.
    pub fn fold_proxy_connection(&mut self) {
        if let Some(value) = self.remove_header("Proxy-Connection") {
            if !value.is_empty() {
                self.set_header_bytes("Connection", &value);
            }
        }
    }

    /// Resolves the destination of this request.
    ///
    /// `CONNECT` names it in the request-target. Otherwise an absolute URI
    /// wins over the `Host` header. Missing ports default by scheme.
    pub fn destination(&self) -> Result<Target, ProxyError> {
        if self.is_connect() {
            return parse_authority(&self.target, None);
        }

        if let Ok(uri) = self.target.parse::<Uri>() {
            if let Some(authority) = uri.authority() {
                return parse_authority(authority.as_str(), uri.scheme_str());
            }
        }

        match self.header("Host") {
            Some(host) if !host.is_empty() => parse_authority(host, None),
            _ => Err(ProxyError::BadRequest("missing host".to_string())),
        }
    }

    /// Rewrites an absolute-form request-target to origin-form, moving the
    /// URI authority into `Host`. Other forms are left alone.
    pub fn to_origin_form(&mut self) {
        if self.is_connect() {
            return;
        }
        let Ok(uri) = self.target.parse::<Uri>() else {
            return;
        };
        let Some(authority) = uri.authority() else {
            return;
        };

        let authority = authority.as_str().to_string();
        self.target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_string();
        self.set_header("Host", &authority);
    }

    /// Serializes the head, terminated by the blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.target, self.proto()).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Reads one request head from `stream`.
///
/// Returns the head and the bytes that arrived after it. `Ok(None)` means the
/// peer closed the connection before sending anything.
pub async fn read_head<R>(stream: &mut R) -> Result<Option<(RequestHead, Vec<u8>)>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::BadRequest(
                "connection closed inside request head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, consumed)) = parse_head(&buf)? {
            return Ok(Some((head, buf.split_off(consumed))));
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest("request head too large".to_string()));
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ProxyError::BadRequest(e.to_string())),
    };
    if consumed > MAX_HEAD_SIZE {
        return Err(ProxyError::BadRequest("request head too large".to_string()));
    }

    let head = RequestHead {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
    };

    Ok(Some((head, consumed)))
}

/// Status line sent to a client once its tunnel is established.
pub fn connect_established(proto: &str) -> Vec<u8> {
    format!("{proto} 200 OK\r\n\r\n").into_bytes()
}

fn plain_response(status: &str, message: &str) -> Vec<u8> {
    let body = format!("{message}\n");
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         X-Content-Type-Options: nosniff\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

pub fn service_unavailable(message: &str) -> Vec<u8> {
    plain_response("503 Service Unavailable", message)
}

pub fn bad_request(message: &str) -> Vec<u8> {
    plain_response("400 Bad Request", message)
}

/// Canned reply for a failure that happened before any tunnel existed.
///
/// Plain I/O errors get no reply; the client is already gone or broken.
pub fn error_response(e: &ProxyError) -> Option<Vec<u8>> {
    match e {
        ProxyError::BadRequest(msg) => Some(bad_request(msg)),
        e if e.is_unavailable() => Some(service_unavailable(&e.to_string())),
        _ => None,
    }
}
