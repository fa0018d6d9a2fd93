//! L2 protocol types
//!
//! Only the pieces of Ethernet the forwarding core inspects: addresses,
//! 802.1Q tag control information and EtherType / ARP constants.

pub mod types;

pub use types::*;
