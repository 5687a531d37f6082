//! Coalescing, caching name resolver.
//!
//! At most one resolution runs per hostname at a time. The first caller for a
//! missing or expired name starts it; callers arriving meanwhile wait on the
//! same result. Every waiter gives up after [`WAIT_TIMEOUT`] without
//! cancelling the resolution, which still settles the cache for later callers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::{Answer, Probe, ResolutionCache};

/// How long a caller waits for an in-flight resolution.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of hostnames kept in the answer cache.
pub const CACHE_CAPACITY: usize = 2 << 15;

struct Inner {
    backends: Vec<Box<dyn Backend>>,
    cache: ResolutionCache,
    wait_timeout: Duration,
}

/// Front for an ordered chain of [`Backend`]s. Cheap to clone.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl Resolver {
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self::with_options(backends, CACHE_CAPACITY, WAIT_TIMEOUT)
    }

    pub fn with_options(
        backends: Vec<Box<dyn Backend>>,
        capacity: usize,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backends,
                cache: ResolutionCache::new(capacity),
                wait_timeout,
            }),
        }
    }

    /// Resolves `host` to an address and its expiry.
    ///
    /// An answer without an address means the host is unresolvable (or the
    /// wait timed out); it is not an error.
    pub async fn lookup(&self, host: &str) -> Answer {
        let host = host.trim_end_matches('.').to_ascii_lowercase();

        let (rx, leader) = match self.inner.cache.probe(&host, Instant::now()) {
            Probe::Hit(answer) => return answer,
            Probe::Wait { rx, leader } => (rx, leader),
        };

        if leader {
            let inner = Arc::clone(&self.inner);
            let host = host.clone();
            tokio::spawn(async move {
                // a panicking backend must still release the waiters
                let answer = AssertUnwindSafe(inner.resolve(&host))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        warn!("resolution of {} panicked", host);
                        Answer::unresolved(Instant::now())
                    });
                let notified = inner.cache.settle(&host, answer);
                debug!("resolved {} -> {:?} ({} waiters)", host, answer.ip, notified);
            });
        }

        match tokio::time::timeout(self.inner.wait_timeout, rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => Answer::unresolved(Instant::now()),
            Err(_) => {
                debug!("lookup {} timed out after {:?}", host, self.inner.wait_timeout);
                Answer::unresolved(Instant::now())
            }
        }
    }

    /// Number of settled answers in the cache.
    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }
}

impl Inner {
    /// Walks the backend chain until one produces an address.
    async fn resolve(&self, host: &str) -> Answer {
        for backend in &self.backends {
            match backend.lookup(host).await {
                Ok(Some((ip, expires_at))) => {
                    return Answer {
                        ip: Some(ip),
                        expires_at,
                    };
                }
                Ok(None) => debug!("{} has no answer for {}", backend.name(), host),
                Err(e) => debug!("{} failed for {}: {}", backend.name(), host, e),
            }
        }

        Answer::unresolved(Instant::now())
    }
}
