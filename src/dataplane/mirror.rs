//! Port mirroring

use super::port::{Port, PortId};
use super::vlan::{VlanBitmap, VlanMode};
use crate::config::MirrorConfig;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Maximum number of mirrors on a bridge
pub const MAX_MIRRORS: usize = 32;

/// One bit per mirror slot
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MirrorMask(u32);

impl MirrorMask {
    pub const EMPTY: MirrorMask = MirrorMask(0);

    pub fn bit(idx: usize) -> Self {
        debug_assert!(idx < MAX_MIRRORS);
        MirrorMask(1 << idx)
    }

    /// Slot indices, lowest first
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let idx = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(idx)
        })
    }
}

impl std::ops::BitOrAssign for MirrorMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MirrorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MirrorMask({:#010x})", self.0)
    }
}

/// Where mirrored copies go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutput {
    Port(PortId),
    Vlan(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mirror {
    pub name: String,
    pub src_ports: BTreeSet<String>,
    pub dst_ports: BTreeSet<String>,
    /// Only traffic in these VLANs is mirrored, all when `None`
    pub vlans: Option<VlanBitmap>,
    pub output: MirrorOutput,
}

impl Mirror {
    /// Resolves a mirror configuration against the current ports.
    /// Returns `Ok(None)` when the mirror has no usable output and must be
    /// destroyed.
    pub fn from_config(config: &MirrorConfig, ports: &[Port]) -> Result<Option<Self>> {
        let output = match (&config.output_port, config.output_vlan) {
            (Some(name), vlan) => {
                let Some(port) = ports.iter().find(|p| &p.name == name) else {
                    warn!(mirror = %config.name, port = %name, "Mirror outputs to port not on bridge");
                    return Err(Error::PortNotFound { name: name.clone() });
                };
                if vlan.is_some() {
                    warn!(mirror = %config.name, "Mirror specifies both output port and output VLAN, ignoring output VLAN");
                }
                MirrorOutput::Port(port.id)
            }
            (None, Some(vlan)) => {
                if vlan > 4095 {
                    return Err(Error::InvalidMirror(format!(
                        "{}: output VLAN {} out of range",
                        config.name, vlan
                    )));
                }
                MirrorOutput::Vlan(vlan)
            }
            (None, None) => {
                warn!(mirror = %config.name, "Mirror does not specify output, ignoring");
                return Ok(None);
            }
        };

        let (src_ports, dst_ports, vlans) = if config.select_all {
            let all: BTreeSet<String> = ports.iter().map(|p| p.name.clone()).collect();
            (all.clone(), all, None)
        } else {
            let vlans: Vec<u16> = config
                .select_vlans
                .iter()
                .copied()
                .filter(|v| {
                    let valid = *v <= 4095;
                    if !valid {
                        warn!(mirror = %config.name, vlan = v, "Ignoring invalid VLAN");
                    }
                    valid
                })
                .collect();
            (
                collect_ports(&config.name, &config.select_src_ports, ports),
                collect_ports(&config.name, &config.select_dst_ports, ports),
                (!vlans.is_empty()).then(|| VlanBitmap::from_vlans(vlans)),
            )
        };

        Ok(Some(Self {
            name: config.name.clone(),
            src_ports,
            dst_ports,
            vlans,
            output,
        }))
    }

    pub fn vlan_is_mirrored(&self, vlan: u16) -> bool {
        self.vlans.as_ref().map_or(true, |set| set.contains(vlan))
    }

    /// True if traffic received on `port` is selected
    fn selects_src(&self, port: &Port) -> bool {
        if self.src_ports.contains(&port.name) {
            return true;
        }
        let Some(vlans) = &self.vlans else {
            return false;
        };
        match &port.vlan_mode {
            VlanMode::Access(vlan) => vlans.contains(*vlan),
            VlanMode::Trunk(None) => true,
            VlanMode::Trunk(Some(trunks)) => vlans.iter().any(|v| trunks.contains(v)),
        }
    }
}

/// Keeps names of existing ports only
fn collect_ports(mirror: &str, names: &[String], ports: &[Port]) -> BTreeSet<String> {
    names
        .iter()
        .filter(|name| {
            let exists = ports.iter().any(|p| &p.name == *name);
            if !exists {
                warn!(mirror = %mirror, port = %name, "Mirror selects nonexistent port");
            }
            exists
        })
        .cloned()
        .collect()
}

/// Fixed table of mirror slots
#[derive(Debug, Clone)]
pub struct MirrorSet {
    slots: Vec<Option<Mirror>>,
}

impl MirrorSet {
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_MIRRORS],
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Mirror> {
        self.slots.get(idx).and_then(|m| m.as_ref())
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|m| m.as_ref().is_some_and(|m| m.name == name))
    }

    /// Stores `mirror` in its existing slot (by name) or the first free
    /// one. Returns the slot and whether anything changed.
    pub fn upsert(&mut self, mirror: Mirror) -> Result<(usize, bool)> {
        if let Some(idx) = self.find(&mirror.name) {
            let changed = self.slots[idx].as_ref() != Some(&mirror);
            self.slots[idx] = Some(mirror);
            return Ok((idx, changed));
        }
        let idx = self
            .slots
            .iter()
            .position(|m| m.is_none())
            .ok_or(Error::MirrorLimit { max: MAX_MIRRORS })?;
        self.slots[idx] = Some(mirror);
        Ok((idx, true))
    }

    pub fn remove(&mut self, idx: usize) -> Option<Mirror> {
        self.slots.get_mut(idx).and_then(|m| m.take())
    }

    /// Destroys every mirror that outputs to `port`
    pub fn remove_output_port(&mut self, port: PortId) -> Vec<String> {
        let mut removed = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|m| m.output == MirrorOutput::Port(port)) {
                if let Some(m) = slot.take() {
                    removed.push(m.name);
                }
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Mirror)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i, m)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recomputes every port's mirror bits and mirror-output flag
    pub fn apply(&self, ports: &mut [Port]) {
        for port in ports.iter_mut() {
            port.src_mirrors = MirrorMask::EMPTY;
            port.dst_mirrors = MirrorMask::EMPTY;
            port.is_mirror_output = false;
        }
        for (idx, mirror) in self.iter() {
            for port in ports.iter_mut() {
                if mirror.selects_src(port) {
                    port.src_mirrors |= MirrorMask::bit(idx);
                }
                if mirror.dst_ports.contains(&port.name) {
                    port.dst_mirrors |= MirrorMask::bit(idx);
                }
                if mirror.output == MirrorOutput::Port(port.id) {
                    port.is_mirror_output = true;
                }
            }
        }
    }
}

impl Default for MirrorSet {
    fn default() -> Self {
        Self::new()
    }
}
