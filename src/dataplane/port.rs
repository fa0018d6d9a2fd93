//! Bridge ports and their slaves

use super::flow::{FlowKey, OfPort};
use super::hooks::Lacp;
use super::mirror::MirrorMask;
use super::tag::Tag;
use super::vlan::{VlanBitmap, VlanMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Stable port identifier, also the port value stored in the learning table
pub type PortId = u32;

/// Number of hash buckets in a bond table (power of two)
pub const BOND_BUCKETS: usize = 256;
pub const BOND_MASK: u32 = BOND_BUCKETS as u32 - 1;

pub const DEFAULT_REBALANCE_INTERVAL: Duration = Duration::from_millis(10_000);
pub const MIN_REBALANCE_INTERVAL: Duration = Duration::from_millis(1_000);

/// Output slave selection policy of a bonded port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BondMode {
    #[serde(rename = "active-backup")]
    ActiveBackup,
    #[default]
    #[serde(rename = "balance-slb")]
    SourceHash,
    /// Falls back to source hashing unless LACP is negotiated
    #[serde(rename = "balance-tcp")]
    TransportHash,
}

impl fmt::Display for BondMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BondMode::ActiveBackup => "active-backup",
            BondMode::SourceHash => "balance-slb",
            BondMode::TransportHash => "balance-tcp",
        };
        f.write_str(s)
    }
}

/// Where raw link state is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkDetect {
    #[default]
    Carrier,
    Miimon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LacpMode {
    #[default]
    Off,
    Active,
    Passive,
}

/// Bonding parameters of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondSettings {
    pub mode: BondMode,
    pub updelay: Duration,
    pub downdelay: Duration,
    pub rebalance_interval: Duration,
    pub detect: LinkDetect,
    pub lacp: LacpMode,
}

impl BondSettings {
    /// Clamps the rebalance interval to its minimum
    pub fn normalized(mut self) -> Self {
        self.rebalance_interval = self.rebalance_interval.max(MIN_REBALANCE_INTERVAL);
        self
    }
}

impl Default for BondSettings {
    fn default() -> Self {
        Self {
            mode: BondMode::default(),
            updelay: Duration::ZERO,
            downdelay: Duration::ZERO,
            rebalance_interval: DEFAULT_REBALANCE_INTERVAL,
            detect: LinkDetect::default(),
            lacp: LacpMode::default(),
        }
    }
}

/// VLAN settings as configured, before bonding overrides them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortVlanConfig {
    /// Access VLAN; ignored on bonds
    pub tag: Option<u16>,
    /// Trunked VLANs, `None` for all
    pub trunks: Option<VlanBitmap>,
}

/// Debounced link state of a slave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    PendingUp(Instant),
    Up,
    PendingDown(Instant),
}

/// One interface of a port
#[derive(Debug, Clone)]
pub struct Slave {
    pub(crate) name: String,
    pub(crate) ofport: OfPort,
    /// May carry traffic now
    pub(crate) enabled: bool,
    /// Last raw link reading
    pub(crate) carrier: bool,
    /// When the pending transition of `enabled` takes effect
    pub(crate) delay_expires: Option<Instant>,
    pub(crate) tag: Tag,
    /// Excluded from flooding
    pub(crate) no_flood: bool,
}

impl Slave {
    pub fn new(name: impl Into<String>, ofport: OfPort, carrier: bool) -> Self {
        Self {
            name: name.into(),
            ofport,
            enabled: carrier,
            carrier,
            delay_expires: None,
            tag: Tag::random(),
            no_flood: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ofport(&self) -> OfPort {
        self.ofport
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn carrier(&self) -> bool {
        self.carrier
    }

    pub fn link_state(&self) -> LinkState {
        match (self.enabled, self.delay_expires) {
            (false, None) => LinkState::Down,
            (false, Some(at)) => LinkState::PendingUp(at),
            (true, None) => LinkState::Up,
            (true, Some(at)) => LinkState::PendingDown(at),
        }
    }
}

/// One bucket of a hash bond
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondEntry {
    /// Index into the port's slaves
    pub slave: Option<usize>,
    pub tx_bytes: u64,
    pub tag: Tag,
}

impl BondEntry {
    fn new() -> Self {
        Self {
            slave: None,
            tx_bytes: 0,
            tag: Tag::random(),
        }
    }
}

/// A bridge port: one interface, or a bond of several
#[derive(Debug)]
pub struct Port {
    pub(crate) id: PortId,
    pub(crate) name: String,
    pub(crate) vlan_config: PortVlanConfig,
    pub(crate) vlan_mode: VlanMode,
    pub(crate) settings: BondSettings,
    pub(crate) slaves: Vec<Slave>,
    pub(crate) active_slave: Option<usize>,
    pub(crate) active_tag: Tag,
    pub(crate) no_slaves_tag: Tag,
    pub(crate) bond_table: Option<Box<[BondEntry]>>,
    pub(crate) next_rebalance: Option<Instant>,
    pub(crate) src_mirrors: MirrorMask,
    pub(crate) dst_mirrors: MirrorMask,
    pub(crate) is_mirror_output: bool,
}

impl Port {
    pub fn new(
        id: PortId,
        name: impl Into<String>,
        vlan_config: PortVlanConfig,
        settings: BondSettings,
    ) -> Self {
        let mut port = Self {
            id,
            name: name.into(),
            vlan_mode: VlanMode::default(),
            vlan_config,
            settings: settings.normalized(),
            slaves: Vec::new(),
            active_slave: None,
            active_tag: Tag::random(),
            no_slaves_tag: Tag::random(),
            bond_table: None,
            next_rebalance: None,
            src_mirrors: MirrorMask::default(),
            dst_mirrors: MirrorMask::default(),
            is_mirror_output: false,
        };
        port.update_vlan_mode();
        port
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vlan_mode(&self) -> &VlanMode {
        &self.vlan_mode
    }

    pub fn settings(&self) -> &BondSettings {
        &self.settings
    }

    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    pub fn active_slave(&self) -> Option<&Slave> {
        self.active_slave.map(|i| &self.slaves[i])
    }

    pub fn bond_table(&self) -> Option<&[BondEntry]> {
        self.bond_table.as_deref()
    }

    pub fn is_mirror_output(&self) -> bool {
        self.is_mirror_output
    }

    pub fn is_bond(&self) -> bool {
        self.slaves.len() >= 2
    }

    pub fn includes_vlan(&self, vlan: u16) -> bool {
        self.vlan_mode.includes_vlan(vlan)
    }

    /// A port only receives floods if every slave accepts them
    pub fn is_floodable(&self) -> bool {
        self.slaves.iter().all(|s| !s.no_flood)
    }

    pub fn slave_index(&self, name: &str) -> Option<usize> {
        self.slaves.iter().position(|s| s.name == name)
    }

    pub fn slave_by_ofport(&self, ofport: OfPort) -> Option<usize> {
        self.slaves.iter().position(|s| s.ofport == ofport)
    }

    /// True if LACP is configured and negotiated on this port
    pub fn lacp_negotiated(&self, lacp: &dyn Lacp) -> bool {
        self.settings.lacp != LacpMode::Off && lacp.is_negotiated(&self.name)
    }

    /// True if LACP does not forbid `slave` from carrying traffic
    pub(crate) fn lacp_may_enable(&self, slave: usize, lacp: &dyn Lacp) -> bool {
        self.settings.lacp == LacpMode::Off || lacp.may_enable(&self.name, &self.slaves[slave].name)
    }

    /// Bucket of `flow` in this port's bond table
    pub fn bucket_index(&self, flow: &FlowKey, vlan: u16, lacp_negotiated: bool) -> usize {
        let hash = if self.settings.mode == BondMode::TransportHash && lacp_negotiated {
            flow.hash_symmetric_l4()
        } else {
            flow.hash_src(vlan)
        };
        (hash & BOND_MASK) as usize
    }

    /// Recomputes the effective VLAN mode. An access tag is ignored once
    /// the port is bonded.
    pub(crate) fn update_vlan_mode(&mut self) -> bool {
        let mode = match self.vlan_config.tag {
            Some(tag) if !self.is_bond() => VlanMode::Access(tag),
            _ => VlanMode::Trunk(self.vlan_config.trunks.clone()),
        };
        let changed = mode != self.vlan_mode;
        self.vlan_mode = mode;
        changed
    }

    /// Allocates or frees the bond table as the slave count and mode
    /// require. Returns true if a table was created or freed.
    pub(crate) fn update_bond_table(&mut self, now: Instant) -> bool {
        let wants_table = self.is_bond() && self.settings.mode != BondMode::ActiveBackup;
        match (wants_table, self.bond_table.is_some()) {
            (true, false) => {
                self.bond_table = Some(vec![BondEntry::new(); BOND_BUCKETS].into_boxed_slice());
                self.no_slaves_tag = Tag::random();
                self.next_rebalance = Some(now + self.settings.rebalance_interval);
                true
            }
            (false, true) => {
                self.bond_table = None;
                self.next_rebalance = None;
                true
            }
            _ => false,
        }
    }

    /// Removes slave `idx`, fixing up every index that refers past it.
    /// Returns the tags of buckets that lost their slave.
    pub(crate) fn detach_slave(&mut self, idx: usize) -> (Slave, Vec<Tag>) {
        let slave = self.slaves.remove(idx);
        let mut orphaned = Vec::new();
        if let Some(table) = self.bond_table.as_mut() {
            for e in table.iter_mut() {
                match e.slave {
                    Some(i) if i == idx => {
                        orphaned.push(e.tag);
                        e.slave = None;
                    }
                    Some(i) if i > idx => e.slave = Some(i - 1),
                    _ => {}
                }
            }
        }
        self.active_slave = match self.active_slave {
            Some(i) if i == idx => None,
            Some(i) if i > idx => Some(i - 1),
            other => other,
        };
        (slave, orphaned)
    }
}
