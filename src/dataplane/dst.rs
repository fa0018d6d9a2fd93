//! Destination sets and their action encoding

use super::flow::{OfPort, VLAN_NONE};
use crate::protocol::VlanTci;

/// Capacity reserved up front so that typical fan-outs never reallocate
pub const DST_INLINE_CAPACITY: usize = 32;

/// One output copy: the slave to send on and the VLAN the copy must carry
/// (`VLAN_NONE` for untagged).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub vlan: u16,
    pub ofport: OfPort,
}

/// Ordered, duplicate-free list of destinations built by one fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSet {
    dsts: Vec<Destination>,
}

impl DestinationSet {
    pub fn new() -> Self {
        Self {
            dsts: Vec::with_capacity(DST_INLINE_CAPACITY),
        }
    }

    /// Appends `dst` unless an identical destination is already present.
    /// Returns whether it was added.
    pub fn push(&mut self, dst: Destination) -> bool {
        if self.contains(&dst) {
            return false;
        }
        self.dsts.push(dst);
        true
    }

    pub fn contains(&self, dst: &Destination) -> bool {
        self.dsts.iter().any(|d| d == dst)
    }

    pub fn contains_port(&self, ofport: OfPort) -> bool {
        self.dsts.iter().any(|d| d.ofport == ofport)
    }

    /// Moves every destination whose VLAN equals `vlan` to the front,
    /// so that the datapath has to change the tag as few times as
    /// possible. Relative order within each half is not preserved.
    pub fn partition(&mut self, vlan: u16) {
        let mut first = 0;
        let mut last = self.dsts.len();

        while first != last {
            while self.dsts[first].vlan == vlan {
                first += 1;
                if first == last {
                    return;
                }
            }
            while self.dsts[last - 1].vlan != vlan {
                last -= 1;
                if last == first {
                    return;
                }
            }
            last -= 1;
            self.dsts.swap(first, last);
            first += 1;
        }
    }

    /// Encodes the destinations as datapath actions for a packet whose
    /// original tag is `orig`.
    ///
    /// A destination on the current VLAN needs only an output. Moving to
    /// `VLAN_NONE` strips the tag; moving to any other VLAN rewrites the
    /// VID and keeps the original priority bits.
    pub fn to_actions(&self, orig: VlanTci) -> Vec<OdpAction> {
        let mut actions = Vec::with_capacity(self.dsts.len() * 2);
        let mut cur_vlan = match orig.vid() {
            0 => VLAN_NONE,
            vid => vid,
        };

        for dst in &self.dsts {
            if dst.vlan != cur_vlan {
                if dst.vlan == VLAN_NONE {
                    actions.push(OdpAction::StripVlan);
                } else {
                    actions.push(OdpAction::SetVlan(VlanTci::new(dst.vlan, orig.pcp())));
                }
                cur_vlan = dst.vlan;
            }
            actions.push(OdpAction::Output(dst.ofport));
        }
        actions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.dsts.iter()
    }

    pub fn as_slice(&self) -> &[Destination] {
        &self.dsts
    }

    pub fn len(&self) -> usize {
        self.dsts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dsts.is_empty()
    }
}

impl Default for DestinationSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Datapath action derived from a destination set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdpAction {
    StripVlan,
    SetVlan(VlanTci),
    Output(OfPort),
}
