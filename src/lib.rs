//! Bridgecore - Software Ethernet switch forwarding core
//!
//! Computes per-flow forwarding decisions for a learning switch with
//! 802.1Q VLANs, bonded ports and port mirroring. Packet I/O, LACP and
//! the flow cache are external collaborators reached through traits.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod protocol;
pub mod telemetry;

pub use error::{Error, Result};
