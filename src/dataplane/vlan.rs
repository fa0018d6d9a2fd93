//! VLAN membership and ingress VLAN resolution

use super::flow::{FlowKey, VLAN_NONE};
use std::fmt;

/// Number of 802.1Q VLAN IDs
pub const VLAN_COUNT: usize = 4096;

/// Fixed-size set of VLAN IDs
#[derive(Clone, PartialEq, Eq)]
pub struct VlanBitmap {
    bits: [u64; VLAN_COUNT / 64],
}

impl VlanBitmap {
    pub fn new() -> Self {
        Self {
            bits: [0; VLAN_COUNT / 64],
        }
    }

    /// Builds a bitmap from a list, ignoring out-of-range IDs
    pub fn from_vlans<I: IntoIterator<Item = u16>>(vlans: I) -> Self {
        let mut bitmap = Self::new();
        for vlan in vlans {
            bitmap.insert(vlan);
        }
        bitmap
    }

    /// Returns false if `vlan` is not a valid 12-bit ID
    pub fn insert(&mut self, vlan: u16) -> bool {
        if vlan as usize >= VLAN_COUNT {
            return false;
        }
        self.bits[vlan as usize / 64] |= 1 << (vlan % 64);
        true
    }

    pub fn contains(&self, vlan: u16) -> bool {
        (vlan as usize) < VLAN_COUNT && self.bits[vlan as usize / 64] & (1 << (vlan % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        (0..VLAN_COUNT as u16).filter(move |v| self.contains(*v))
    }
}

impl Default for VlanBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for VlanBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// How a port treats 802.1Q tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanMode {
    /// Untagged port implicitly in one VLAN
    Access(u16),
    /// Tagged port carrying the listed VLANs, or every VLAN when `None`.
    /// Untagged traffic is never restricted on a trunk.
    Trunk(Option<VlanBitmap>),
}

impl VlanMode {
    pub fn is_access(&self) -> bool {
        matches!(self, VlanMode::Access(_))
    }

    pub fn access_vlan(&self) -> Option<u16> {
        match self {
            VlanMode::Access(vlan) => Some(*vlan),
            VlanMode::Trunk(_) => None,
        }
    }

    /// True if this is a trunk port that carries `vlan` tagged
    pub fn trunks_vlan(&self, vlan: u16) -> bool {
        match self {
            VlanMode::Access(_) => false,
            VlanMode::Trunk(_) if vlan == VLAN_NONE => true,
            VlanMode::Trunk(None) => true,
            VlanMode::Trunk(Some(set)) => set.contains(vlan),
        }
    }

    /// True if the port is a member of `vlan`, tagged or not
    pub fn includes_vlan(&self, vlan: u16) -> bool {
        self.access_vlan() == Some(vlan) || self.trunks_vlan(vlan)
    }
}

impl Default for VlanMode {
    fn default() -> Self {
        VlanMode::Trunk(None)
    }
}

/// Why a flow's VLAN is unacceptable on its ingress port
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VlanError {
    #[error("VLAN {tagged} tagged packet on port with implicit VLAN {access}")]
    DoubleTagged { tagged: u16, access: u16 },
    #[error("VLAN {vlan} tagged packet on port not trunking it")]
    NotTrunked { vlan: u16 },
}

/// Computes the effective VLAN of a flow arriving on a port in `mode`.
///
/// Access ports reject tagged frames and otherwise place the frame in
/// their VLAN. Trunk ports accept untagged frames (effective VLAN
/// `VLAN_NONE`) and tagged frames whose VID they carry.
pub fn resolve(flow: &FlowKey, mode: &VlanMode) -> Result<u16, VlanError> {
    let tagged = flow.vlan_tci.vid();
    match mode {
        VlanMode::Access(access) => {
            if tagged != 0 {
                Err(VlanError::DoubleTagged {
                    tagged,
                    access: *access,
                })
            } else {
                Ok(*access)
            }
        }
        VlanMode::Trunk(_) => {
            if tagged == 0 {
                Ok(VLAN_NONE)
            } else if mode.trunks_vlan(tagged) {
                Ok(tagged)
            } else {
                Err(VlanError::NotTrunked { vlan: tagged })
            }
        }
    }
}
