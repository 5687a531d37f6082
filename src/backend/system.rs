//! The operating system's resolver.

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use super::{Backend, Record};
use crate::error::BackendError;

/// Resolves through `getaddrinfo`. Answers are not cached: the system gives
/// us no TTL, so every result is stale immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Backend for SystemResolver {
    fn name(&self) -> &'static str {
        "system"
    }

    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Option<Record>, BackendError>> {
        async move {
            let mut addrs = tokio::net::lookup_host((host, 0)).await?;
            Ok(addrs.next().map(|addr| (addr.ip(), Instant::now())))
        }
        .boxed()
    }
}
