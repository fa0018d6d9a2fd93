//! Data plane components
//!
//! Handles forwarding decisions: VLAN resolution, admission, MAC learning,
//! bonding and mirroring, composed into a destination set per flow.

mod admin;
mod admission;
mod bond;
mod bridge;
mod compose;
mod dst;
mod fdb;
mod flow;
pub mod hooks;
mod mirror;
mod port;
mod rebalance;
mod tag;
mod vlan;

pub use admin::BondSummary;
pub use admission::{Admitted, Inadmissible};
pub use bond::bond_hash;
pub use bridge::{Bridge, Decision};
pub use dst::{Destination, DestinationSet, OdpAction};
pub use fdb::{Fdb, GratArpLock, LearnedMac, MacLearning, MacLookup, DEFAULT_AGING_TIME_SECS};
pub use flow::{FlowKey, OfPort, VLAN_NONE};
pub use hooks::{Announcement, CarrierSource, Hooks, Lacp, LearningPacketSender, Revalidator};
pub use mirror::{Mirror, MirrorOutput, MirrorSet, MAX_MIRRORS};
pub use port::{
    BondEntry, BondMode, BondSettings, LacpMode, LinkDetect, LinkState, Port, PortId,
    PortVlanConfig, Slave, BOND_BUCKETS, DEFAULT_REBALANCE_INTERVAL,
};
pub use tag::{Tag, TagSet};
pub use vlan::{resolve as resolve_vlan, VlanBitmap, VlanError, VlanMode};
