//! Address-range classification.
//!
//! A [`RangeIndex`] answers "is this address inside one of my ranges?" with a
//! binary search over intervals sorted by upper bound. Two indexes exist at
//! runtime: the fixed private/loopback set and the domestic set, which the
//! feed refresh replaces wholesale.

pub mod feed;
mod range;

pub use range::{AddrKey, AddressRange};

use std::net::IpAddr;
use std::sync::RwLock;

use crate::error::RangeError;

/// Private and loopback prefixes that are always reached directly.
pub const PRIVATE_RANGES: &[&str] = &[
    // private
    "192.168.0.0/16",
    "172.16.0.0/12",
    "10.0.0.0/8",
    "fc00::/7",
    // loopback
    "127.0.0.0/8",
    "::1/128",
];

/// Sorted, non-overlapping address intervals with atomic bulk replace.
///
/// Ranges are kept sorted by upper bound. Overlapping input is not merged;
/// callers supply a disjoint set per source feed.
pub struct RangeIndex {
    ranges: RwLock<Vec<AddressRange>>,
}

impl RangeIndex {
    /// Builds an index from CIDR literals. Fails if any literal is invalid.
    pub fn build<S: AsRef<str>>(cidrs: &[S]) -> Result<Self, RangeError> {
        Ok(Self {
            ranges: RwLock::new(build_sorted(cidrs)?),
        })
    }

    /// An index that contains nothing.
    pub fn empty() -> Self {
        Self {
            ranges: RwLock::new(Vec::new()),
        }
    }

    /// The fixed private/loopback index.
    pub fn private() -> Self {
        let ranges = PRIVATE_RANGES
            .iter()
            .filter_map(|cidr| AddressRange::parse(cidr).ok())
            .collect();
        Self::from_ranges(ranges)
    }

    fn from_ranges(mut ranges: Vec<AddressRange>) -> Self {
        ranges.sort_by_key(|r| r.upper);
        Self {
            ranges: RwLock::new(ranges),
        }
    }

    /// Checks whether `addr` falls inside any range.
    ///
    /// The first range whose upper bound is not below the target is the only
    /// candidate that can hold it, given disjoint ranges.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let key = AddrKey::from_ip(addr);

        let Ok(ranges) = self.ranges.read() else {
            return false;
        };

        let idx = ranges.partition_point(|r| r.upper < key);
        ranges.get(idx).is_some_and(|r| r.contains(key))
    }

    /// Like [`contains`](Self::contains) for an optional address; `None` is
    /// never contained.
    pub fn contains_opt(&self, addr: Option<IpAddr>) -> bool {
        addr.is_some_and(|a| self.contains(a))
    }

    /// Replaces every range at once.
    ///
    /// The new set is parsed and sorted before the write lock is taken, so a
    /// concurrent lookup sees either the old or the new set. On a parse
    /// failure the current ranges are kept.
    pub fn replace<S: AsRef<str>>(&self, cidrs: &[S]) -> Result<usize, RangeError> {
        let fresh = build_sorted(cidrs)?;
        let len = fresh.len();

        match self.ranges.write() {
            Ok(mut ranges) => *ranges = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }

        Ok(len)
    }

    pub fn len(&self) -> usize {
        self.ranges.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RangeIndex {
    fn default() -> Self {
        Self::empty()
    }
}

fn build_sorted<S: AsRef<str>>(cidrs: &[S]) -> Result<Vec<AddressRange>, RangeError> {
    let mut ranges = cidrs
        .iter()
        .map(|c| AddressRange::parse(c.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    ranges.sort_by_key(|r| r.upper);
    Ok(ranges)
}
