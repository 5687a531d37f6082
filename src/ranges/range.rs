//! Inclusive address intervals derived from CIDR literals.

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

use crate::error::RangeError;

/// A point in address space, ordered within its family.
///
/// The derived ordering sorts every IPv4 key before every IPv6 key, so a
/// range never spans families and a lookup never matches across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddrKey {
    V4(u32),
    V6(u128),
}

impl AddrKey {
    /// Normalizes `addr` to its natural family. IPv4-mapped IPv6 addresses
    /// become IPv4 keys.
    pub fn from_ip(addr: IpAddr) -> Self {
        match addr.to_canonical() {
            IpAddr::V4(v4) => AddrKey::V4(u32::from(v4)),
            IpAddr::V6(v6) => AddrKey::V6(u128::from(v6)),
        }
    }
}

/// Inclusive interval `[lower, upper]` covering one CIDR prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub lower: AddrKey,
    pub upper: AddrKey,
}

impl AddressRange {
    /// Parses a CIDR literal such as `10.0.0.0/8` or `fc00::/7`.
    ///
    /// Host bits are cleared for the lower bound and set for the upper bound,
    /// so `10.1.2.3/8` covers the same interval as `10.0.0.0/8`.
    pub fn parse(cidr: &str) -> Result<Self, RangeError> {
        let network = IpNetwork::from_str(cidr.trim())
            .map_err(|_| RangeError::InvalidCidr(cidr.to_string()))?;

        let range = match network {
            IpNetwork::V4(net) => {
                let ip = u32::from(net.ip());
                let mask = prefix_mask_u32(net.prefix());
                AddressRange {
                    lower: AddrKey::V4(ip & mask),
                    upper: AddrKey::V4(ip | !mask),
                }
            }
            IpNetwork::V6(net) => {
                let ip = u128::from(net.ip());
                let mask = prefix_mask_u128(net.prefix());
                AddressRange {
                    lower: AddrKey::V6(ip & mask),
                    upper: AddrKey::V6(ip | !mask),
                }
            }
        };

        Ok(range)
    }

    pub fn contains(&self, key: AddrKey) -> bool {
        self.lower <= key && key <= self.upper
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        p => u32::MAX << (32 - u32::from(p.min(32))),
    }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    match prefix {
        0 => 0,
        p => u128::MAX << (128 - u32::from(p.min(128))),
    }
}
