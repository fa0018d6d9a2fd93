//! Forwarding Database (MAC learning table)
//!
//! Provides the learning-table collaborator used by the forwarding core:
//! - MAC address learning from admitted flows
//! - Lookup of a destination's port, with change tags for revalidation
//! - Gratuitous ARP locking to ignore reflections over bond slaves
//! - Aging mechanism for stale entries
//! - Per-VLAN tables (IVL - Independent VLAN Learning) and
//!   learning-disabled ("flood") VLANs

use super::port::PortId;
use super::tag::{Tag, TagSet};
use super::vlan::VlanBitmap;
use crate::protocol::MacAddr;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default aging time in seconds (5 minutes, per IEEE 802.1D)
pub const DEFAULT_AGING_TIME_SECS: u64 = 300;

/// How long an entry refreshed by a gratuitous ARP on a single-slave
/// port ignores gratuitous ARPs arriving on bonds.
pub const GRAT_ARP_LOCK_TIME: Duration = Duration::from_secs(5);

/// Maximum number of learned MACs across all VLANs
pub const MAC_MAX: usize = 2048;

/// How a learning update interacts with the gratuitous ARP lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GratArpLock {
    /// Not a gratuitous ARP
    None,
    /// Gratuitous ARP from a single-slave port: learn and lock
    Set,
    /// Gratuitous ARP from a bond: learn only if not locked
    Check,
}

/// Result of a source lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacLookup {
    pub port: PortId,
    pub grat_arp_locked: bool,
}

/// A learned (MAC, VLAN) location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LearnedMac {
    pub mac: MacAddr,
    pub vlan: u16,
    pub port: PortId,
}

/// Learning table as seen by the forwarding core
pub trait MacLearning {
    /// True if `vlan` has learning enabled and `mac` is learnable
    fn may_learn(&self, mac: MacAddr, vlan: u16) -> bool;

    /// Records that `mac` was seen on `port`. Returns the tag to
    /// revalidate if this changed where `mac` lives.
    fn learn(&mut self, mac: MacAddr, vlan: u16, port: PortId, lock: GratArpLock) -> Option<Tag>;

    fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<MacLookup>;

    /// Destination lookup for forwarding. Adds the tag that must be
    /// revalidated when the answer changes, for known and unknown MACs.
    fn lookup_tag(&self, mac: MacAddr, vlan: u16, tags: &mut TagSet) -> Option<PortId>;

    /// Every learned MAC, least recently seen first
    fn entries(&self) -> Vec<LearnedMac>;

    /// Forgets every MAC learned on `port`, returning their tags
    fn flush_port(&mut self, port: PortId) -> Vec<Tag>;

    /// Disables learning on the given VLANs. Entries already learned on
    /// them are dropped. Returns true if the set changed.
    fn set_flood_vlans(&mut self, vlans: Option<VlanBitmap>) -> bool;

    /// Forgets entries idle past the aging time, returning their tags
    fn expire(&mut self) -> Vec<Tag>;

    /// Number of learned MACs across all VLANs
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FDB entry with aging support
#[derive(Debug, Clone)]
struct FdbEntry {
    port: PortId,
    last_seen: Instant,
    grat_arp_lock: Option<Instant>,
    tag: Tag,
}

/// Forwarding Database for L2 switching
#[derive(Debug)]
pub struct Fdb {
    /// VLAN ID -> (MAC -> Entry)
    tables: HashMap<u16, HashMap<MacAddr, FdbEntry>>,
    /// VLANs on which learning is disabled
    flood_vlans: Option<VlanBitmap>,
    /// Maximum age for entries
    max_age: Duration,
    /// Seed for tags of MACs that have not been learned
    secret: u32,
}

impl Default for Fdb {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_AGING_TIME_SECS))
    }
}

impl Fdb {
    pub fn new(max_age: Duration) -> Self {
        Self {
            tables: HashMap::new(),
            flood_vlans: None,
            max_age,
            secret: rand::random(),
        }
    }

    fn is_learning_vlan(&self, vlan: u16) -> bool {
        self.flood_vlans
            .as_ref()
            .map_or(true, |set| !set.contains(vlan))
    }

    fn unknown_mac_tag(&self, mac: MacAddr, vlan: u16) -> Tag {
        let mut key = [0u8; 8];
        key[..6].copy_from_slice(&mac.0);
        key[6..].copy_from_slice(&vlan.to_be_bytes());
        Tag::from_key(&key, self.secret)
    }

    // ========================================
    // Aging
    // ========================================

    /// Remove aged-out entries
    ///
    /// Should be called periodically (e.g., every 10-30 seconds) to clean
    /// up stale FDB entries. Returns the tags of removed entries.
    pub fn age_out(&mut self) -> Vec<Tag> {
        let now = Instant::now();
        let max_age = self.max_age;
        let mut removed = Vec::new();

        for table in self.tables.values_mut() {
            table.retain(|_, entry| {
                let keep = now.duration_since(entry.last_seen) < max_age;
                if !keep {
                    removed.push(entry.tag);
                }
                keep
            });
        }

        removed
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .tables
            .iter()
            .flat_map(|(vlan, table)| table.iter().map(move |(mac, e)| (e.last_seen, *vlan, *mac)))
            .min();
        if let Some((_, vlan, mac)) = oldest {
            if let Some(table) = self.tables.get_mut(&vlan) {
                table.remove(&mac);
            }
        }
    }

    // ========================================
    // Utility Methods
    // ========================================

    /// Get number of MAC entries
    pub fn len(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Check if FDB is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MacLearning for Fdb {
    fn may_learn(&self, mac: MacAddr, vlan: u16) -> bool {
        self.is_learning_vlan(vlan) && !mac.is_multicast()
    }

    fn learn(&mut self, mac: MacAddr, vlan: u16, port: PortId, lock: GratArpLock) -> Option<Tag> {
        // Don't learn broadcast/multicast addresses
        if !self.may_learn(mac, vlan) {
            return None;
        }

        let exists = self.tables.get(&vlan).is_some_and(|t| t.contains_key(&mac));
        if !exists && self.len() >= MAC_MAX {
            self.evict_oldest();
        }

        let unknown_tag = self.unknown_mac_tag(mac, vlan);
        let now = Instant::now();
        let entry = self
            .tables
            .entry(vlan)
            .or_default()
            .entry(mac)
            .or_insert_with(|| FdbEntry {
                port: PortId::MAX,
                last_seen: now,
                grat_arp_lock: None,
                tag: unknown_tag,
            });

        let locked = entry.grat_arp_lock.is_some_and(|until| now < until);
        if lock == GratArpLock::Check && locked {
            return None;
        }

        entry.last_seen = now;
        if lock == GratArpLock::Set {
            entry.grat_arp_lock = Some(now + GRAT_ARP_LOCK_TIME);
        }

        if entry.port != port {
            let old_tag = entry.tag;
            entry.port = port;
            entry.tag = Tag::random();
            return Some(old_tag);
        }
        None
    }

    fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<MacLookup> {
        let entry = self.tables.get(&vlan)?.get(&mac)?;
        Some(MacLookup {
            port: entry.port,
            grat_arp_locked: entry
                .grat_arp_lock
                .is_some_and(|until| Instant::now() < until),
        })
    }

    fn lookup_tag(&self, mac: MacAddr, vlan: u16, tags: &mut TagSet) -> Option<PortId> {
        if mac.is_multicast() || !self.is_learning_vlan(vlan) {
            return None;
        }
        match self.tables.get(&vlan).and_then(|t| t.get(&mac)) {
            Some(entry) => {
                tags.insert(entry.tag);
                Some(entry.port)
            }
            None => {
                tags.insert(self.unknown_mac_tag(mac, vlan));
                None
            }
        }
    }

    fn entries(&self) -> Vec<LearnedMac> {
        let mut entries: Vec<(Instant, LearnedMac)> = self
            .tables
            .iter()
            .flat_map(|(vlan, table)| {
                table.iter().map(move |(mac, e)| {
                    (
                        e.last_seen,
                        LearnedMac {
                            mac: *mac,
                            vlan: *vlan,
                            port: e.port,
                        },
                    )
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.vlan.cmp(&b.1.vlan))
                .then(a.1.mac.cmp(&b.1.mac))
        });
        entries.into_iter().map(|(_, e)| e).collect()
    }

    fn flush_port(&mut self, port: PortId) -> Vec<Tag> {
        let mut removed = Vec::new();
        for table in self.tables.values_mut() {
            table.retain(|_, entry| {
                let keep = entry.port != port;
                if !keep {
                    removed.push(entry.tag);
                }
                keep
            });
        }
        removed
    }

    fn set_flood_vlans(&mut self, vlans: Option<VlanBitmap>) -> bool {
        let vlans = vlans.filter(|v| !v.is_empty());
        if vlans == self.flood_vlans {
            return false;
        }
        if let Some(ref set) = vlans {
            self.tables.retain(|vlan, _| !set.contains(*vlan));
        }
        self.flood_vlans = vlans;
        true
    }

    fn expire(&mut self) -> Vec<Tag> {
        self.age_out()
    }

    fn len(&self) -> usize {
        Fdb::len(self)
    }
}
