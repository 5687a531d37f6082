//! Misha - a split-routing HTTP proxy.
//!
//! Domestic and private destinations are dialed directly; everything else is
//! tunnelled through a remote peer that authenticates with a shared secret.
//! This library exposes the components for the binary, benchmarks and tests.

pub mod backend;
pub mod cache;
pub mod dns;
pub mod error;
pub mod fetch;
pub mod proxy;
pub mod ranges;
pub mod remote;
pub mod request;
pub mod resolver;
pub mod router;
pub mod stats;
pub mod transport;
