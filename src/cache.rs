//! Per-hostname answer cache with in-flight coordination.
//!
//! Settled answers live in a bounded LRU. Hostnames with a resolution in
//! flight are tracked in a separate map of waiters, so LRU eviction never
//! drops a caller that is still waiting for its answer.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Result of a lookup: the address, if any, and when it goes stale.
///
/// A missing address means the host could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    pub ip: Option<IpAddr>,
    pub expires_at: Instant,
}

impl Answer {
    /// An answer with no address that is already stale.
    pub fn unresolved(now: Instant) -> Self {
        Self {
            ip: None,
            expires_at: now,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Outcome of asking the cache about a hostname.
#[derive(Debug)]
pub enum Probe {
    /// A settled answer that has not expired.
    Hit(Answer),
    /// The caller must wait on `rx`. When `leader` is set, the caller is the
    /// one that has to start the resolution and later call `settle`.
    Wait {
        rx: oneshot::Receiver<Answer>,
        leader: bool,
    },
}

struct Table {
    answers: LruCache<String, Answer, FxBuildHasher>,
    pending: FxHashMap<String, Vec<oneshot::Sender<Answer>>>,
}

/// Hostname-keyed answer cache.
pub struct ResolutionCache {
    table: Mutex<Table>,
}

impl ResolutionCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: Mutex::new(Table {
                answers: LruCache::with_hasher(capacity, FxBuildHasher),
                pending: FxHashMap::default(),
            }),
        }
    }

    /// Looks up `host`, registering the caller as a waiter on a miss.
    ///
    /// Missing and expired entries make exactly one caller the leader; every
    /// other caller arriving before `settle` joins the same waiter list.
    pub fn probe(&self, host: &str, now: Instant) -> Probe {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        let (tx, rx) = oneshot::channel();

        if let Some(waiters) = table.pending.get_mut(host) {
            waiters.push(tx);
            return Probe::Wait { rx, leader: false };
        }

        if let Some(answer) = table.answers.get(host) {
            if answer.is_fresh(now) {
                return Probe::Hit(*answer);
            }
        }

        table.pending.insert(host.to_string(), vec![tx]);
        Probe::Wait { rx, leader: true }
    }

    /// Stores the answer for `host` and notifies every registered waiter.
    ///
    /// Returns the number of waiters that were still listening.
    pub fn settle(&self, host: &str, answer: Answer) -> usize {
        let waiters = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.answers.put(host.to_string(), answer);
            table.pending.remove(host).unwrap_or_default()
        };

        waiters
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .map(|tx| tx.send(answer))
            .filter(Result::is_ok)
            .count()
    }

    /// Number of settled answers currently held.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .map(|t| t.answers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of hostnames with a resolution in flight.
    pub fn in_flight(&self) -> usize {
        self.table
            .lock()
            .map(|t| t.pending.len())
            .unwrap_or(0)
    }
}
