//! Name resolution strategies.
//!
//! A [`Backend`] answers a single lookup on its own terms. The resolver
//! tries its backends in order and takes the first address any of them
//! produces; an error or an empty answer just moves on to the next one.

mod doh;
mod hosts;
mod system;

pub use doh::{DnsOverHttps, DohFormat};
pub use hosts::{DEFAULT_HOSTS_PATH, HostsFile};
pub use system::SystemResolver;

use std::net::IpAddr;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::error::BackendError;

/// An address and the instant it stops being valid.
pub type Record = (IpAddr, Instant);

/// One resolution strategy in the chain.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Resolves `host`. `Ok(None)` means the backend has no answer.
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Option<Record>, BackendError>>;
}
