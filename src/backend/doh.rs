//! DNS over HTTPS.
//!
//! Two request styles are supported:
//! - JSON: `GET ?name=<host>` with `Accept: application/dns-json`
//! - wire: `GET ?dns=<base64url message>` with `application/dns-message`

use std::net::IpAddr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use super::{Backend, Record};
use crate::dns::{DnsQuery, DnsResponse, TYPE_A, TYPE_AAAA};
use crate::error::BackendError;
use crate::fetch::HttpClient;

const DNS_JSON: &str = "application/dns-json";
const DNS_MESSAGE: &str = "application/dns-message";

/// Which DoH request style the provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DohFormat {
    #[default]
    Json,
    Wire,
}

#[derive(Debug, Deserialize)]
struct JsonResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<JsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct JsonAnswer {
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    data: String,
}

/// DNS-over-HTTPS backend.
///
/// The answer's TTL is honored unless `static_ttl` is set, in which case the
/// static value replaces it.
pub struct DnsOverHttps {
    client: HttpClient,
    provider: String,
    format: DohFormat,
    static_ttl: Option<Duration>,
}

impl DnsOverHttps {
    pub fn new(
        client: HttpClient,
        provider: impl Into<String>,
        format: DohFormat,
        static_ttl: Option<Duration>,
    ) -> Self {
        Self {
            client,
            provider: provider.into(),
            format,
            static_ttl,
        }
    }

    fn url(&self, param: &str, value: &str) -> String {
        let sep = if self.provider.contains('?') { '&' } else { '?' };
        format!("{}{}{}={}", self.provider, sep, param, value)
    }

    fn expiry(&self, wire_ttl: u32) -> Instant {
        let ttl = self
            .static_ttl
            .unwrap_or_else(|| Duration::from_secs(u64::from(wire_ttl)));
        Instant::now() + ttl
    }

    async fn lookup_json(&self, host: &str) -> Result<Option<Record>, BackendError> {
        let body = self
            .client
            .get(&self.url("name", host), &[("Accept", DNS_JSON)])
            .await?;

        let response: JsonResponse =
            serde_json::from_slice(&body).map_err(|e| BackendError::Decode(e.to_string()))?;
        if response.status != 0 {
            debug!("DoH status {} for {}", response.status, host);
            return Ok(None);
        }

        let Some(answer) = response
            .answer
            .iter()
            .find(|a| a.rtype == TYPE_A || a.rtype == TYPE_AAAA)
        else {
            return Ok(None);
        };

        Ok(answer
            .data
            .parse::<IpAddr>()
            .ok()
            .map(|ip| (ip, self.expiry(answer.ttl))))
    }

    async fn lookup_wire(&self, host: &str) -> Result<Option<Record>, BackendError> {
        let Some(query) = DnsQuery::new(0, host, TYPE_A) else {
            return Ok(None);
        };
        let encoded = URL_SAFE_NO_PAD.encode(query.to_bytes());

        let body = self
            .client
            .get(
                &self.url("dns", &encoded),
                &[("Accept", DNS_MESSAGE), ("Content-Type", DNS_MESSAGE)],
            )
            .await?;

        let response = DnsResponse::parse(&body)
            .ok_or_else(|| BackendError::Decode("malformed DNS message".to_string()))?;
        if response.rcode() != 0 {
            debug!("DoH rcode {} for {}", response.rcode(), host);
            return Ok(None);
        }

        Ok(response
            .first_address(TYPE_A)
            .map(|(ip, ttl)| (ip, self.expiry(ttl))))
    }
}

impl Backend for DnsOverHttps {
    fn name(&self) -> &'static str {
        "doh"
    }

    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Option<Record>, BackendError>> {
        match self.format {
            DohFormat::Json => self.lookup_json(host).boxed(),
            DohFormat::Wire => self.lookup_wire(host).boxed(),
        }
    }
}
