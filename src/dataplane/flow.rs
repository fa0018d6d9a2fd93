//! Flow key
//!
//! The immutable summary of a packet (or of a cached flow being
//! revalidated) that every forwarding decision is computed from.

use crate::protocol::{EtherType, MacAddr, VlanTci, ARP_OP_REPLY, ARP_OP_REQUEST};
use std::net::Ipv4Addr;

/// Datapath port number of a slave interface
pub type OfPort = u16;

/// VLAN value meaning "no 802.1Q header"
pub const VLAN_NONE: u16 = 0xffff;

/// Flow key
///
/// For ARP frames `nw_src`/`nw_dst` hold the sender/target protocol
/// addresses and `nw_proto` holds the low byte of the ARP opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub in_port: OfPort,
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    pub vlan_tci: VlanTci,
    pub dl_type: u16,
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub nw_proto: u8,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl FlowKey {
    /// L2-only flow, the common shape for tests and learning packets
    pub fn l2(in_port: OfPort, dl_src: MacAddr, dl_dst: MacAddr, vlan_tci: VlanTci) -> Self {
        Self {
            in_port,
            dl_src,
            dl_dst,
            vlan_tci,
            dl_type: EtherType::Ipv4 as u16,
            nw_src: Ipv4Addr::UNSPECIFIED,
            nw_dst: Ipv4Addr::UNSPECIFIED,
            nw_proto: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }

    /// The VLAN the frame carried on the wire: its VID, or `VLAN_NONE`
    /// when it had no tag (or only a priority tag).
    pub fn wire_vlan(&self) -> u16 {
        match self.vlan_tci.vid() {
            0 => VLAN_NONE,
            vid => vid,
        }
    }

    /// A VM broadcasts a gratuitous ARP to announce that it resumed after
    /// migration. Older guests use ARP replies, newer ones use requests
    /// whose sender and target addresses are equal.
    pub fn is_gratuitous_arp(&self) -> bool {
        self.dl_type == EtherType::Arp as u16
            && self.dl_dst.is_broadcast()
            && (self.nw_proto == ARP_OP_REPLY
                || (self.nw_proto == ARP_OP_REQUEST && self.nw_src == self.nw_dst))
    }

    /// Hash of source MAC and VLAN, used by source-hash bonding
    pub fn hash_src(&self, vlan: u16) -> u32 {
        hash_mac_vlan(self.dl_src, vlan)
    }

    /// Symmetric L2-L4 hash: both directions of a connection hash to the
    /// same value. The VLAN tag is ignored.
    pub fn hash_symmetric_l4(&self) -> u32 {
        let mut fields = [0u8; 6 + 2 + 4 + 1 + 2];
        for (i, b) in fields[..6].iter_mut().enumerate() {
            *b = self.dl_src.0[i] ^ self.dl_dst.0[i];
        }
        fields[6..8].copy_from_slice(&self.dl_type.to_be_bytes());
        let nw = u32::from(self.nw_src) ^ u32::from(self.nw_dst);
        fields[8..12].copy_from_slice(&nw.to_be_bytes());
        fields[12] = self.nw_proto;
        fields[13..15].copy_from_slice(&(self.tp_src ^ self.tp_dst).to_be_bytes());
        crc32fast::hash(&fields)
    }
}

pub fn hash_mac_vlan(mac: MacAddr, vlan: u16) -> u32 {
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&mac.0);
    bytes[6..].copy_from_slice(&vlan.to_be_bytes());
    crc32fast::hash(&bytes)
}
