//! Static host table (`/etc/hosts`).

use std::net::IpAddr;
use std::path::PathBuf;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use super::{Backend, Record};
use crate::error::BackendError;

pub const DEFAULT_HOSTS_PATH: &str = "/etc/hosts";

/// Looks names up in a hosts file, re-reading it on every lookup so edits
/// take effect immediately. Answers are stale at once.
#[derive(Debug, Clone)]
pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for HostsFile {
    fn default() -> Self {
        Self::new(DEFAULT_HOSTS_PATH)
    }
}

impl Backend for HostsFile {
    fn name(&self) -> &'static str {
        "hosts"
    }

    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Option<Record>, BackendError>> {
        async move {
            let text = match tokio::fs::read_to_string(&self.path).await {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(find_host(&text, host).map(|ip| (ip, Instant::now())))
        }
        .boxed()
    }
}

/// First address mapped to `host` in hosts-file `text`.
fn find_host(text: &str, host: &str) -> Option<IpAddr> {
    let host = host.trim_end_matches('.');

    text.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let ip: IpAddr = fields.next()?.parse().ok()?;
        fields
            .any(|name| name.trim_end_matches('.').eq_ignore_ascii_case(host))
            .then_some(ip)
    })
}
