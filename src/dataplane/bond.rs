//! Bonding: output slave selection, link debouncing and failover
//!
//! Every operation that can change an earlier forwarding decision reports
//! the decision's old tag to the revalidator:
//! - a slave's tag when it is disabled,
//! - the port's active tag when the active slave changes,
//! - the port's "no slaves" tag when a slave becomes usable again,
//! - a bucket's tag when the bucket moves to another slave.

use super::fdb::MacLearning;
use super::flow::{hash_mac_vlan, FlowKey, OfPort, VLAN_NONE};
use super::hooks::{Announcement, Hooks};
use super::port::{BondMode, Port, BOND_MASK};
use super::tag::{Tag, TagSet};
use crate::protocol::{MacAddr, VlanTci};
use crate::telemetry::MetricsRegistry;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything outside a port that bonding operations touch
pub(crate) struct BondCtx<'a> {
    pub hooks: &'a mut Hooks,
    pub ml: &'a dyn MacLearning,
    pub metrics: &'a MetricsRegistry,
    pub now: Instant,
}

impl BondCtx<'_> {
    pub fn revalidate(&mut self, tag: Tag) {
        self.metrics.revalidations.inc();
        self.hooks.revalidator.revalidate(tag);
    }
}

/// Bucket a (MAC, VLAN) pair hashes to under source hashing
pub fn bond_hash(mac: MacAddr, vlan: u16) -> usize {
    (hash_mac_vlan(mac, vlan) & BOND_MASK) as usize
}

impl Port {
    // ========================================
    // Output selection
    // ========================================

    /// Picks the slave that carries `flow` in `vlan` out of this port.
    ///
    /// Adds the tags the answer depends on to `tags`. Returns `None` when
    /// no slave can carry traffic.
    pub(crate) fn select_slave(
        &mut self,
        flow: &FlowKey,
        vlan: u16,
        tags: &mut TagSet,
        ctx: &mut BondCtx,
    ) -> Option<OfPort> {
        assert!(!self.slaves.is_empty(), "port {} has no slaves", self.name);

        let idx = if self.slaves.len() == 1 {
            0
        } else if self.settings.mode == BondMode::ActiveBackup || self.bond_table.is_none() {
            let Some(idx) = self.active_slave else {
                tags.insert(self.no_slaves_tag);
                return None;
            };
            tags.insert(self.active_tag);
            idx
        } else {
            let negotiated = self.lacp_negotiated(ctx.hooks.lacp.as_ref());
            let bucket = self.bucket_index(flow, vlan, negotiated);
            let current = self.bond_table.as_ref().and_then(|t| t[bucket].slave);
            let usable = current.filter(|i| self.slaves.get(*i).is_some_and(|s| s.enabled));

            let idx = match usable {
                Some(idx) => idx,
                None => {
                    let Some(idx) = self.choose_slave(ctx, false) else {
                        tags.insert(self.no_slaves_tag);
                        return None;
                    };
                    if let Some(table) = self.bond_table.as_mut() {
                        table[bucket].slave = Some(idx);
                        table[bucket].tag = Tag::random();
                    }
                    idx
                }
            };
            if let Some(table) = self.bond_table.as_ref() {
                tags.insert(table[bucket].tag);
            }
            idx
        };

        let slave = &self.slaves[idx];
        tags.insert(slave.tag);
        Some(slave.ofport)
    }

    /// First enabled slave. Failing that, force-enables the slave whose
    /// updelay expires soonest.
    pub(crate) fn choose_slave(&mut self, ctx: &mut BondCtx, moving_active: bool) -> Option<usize> {
        let mut best: Option<(usize, Instant)> = None;
        for (i, slave) in self.slaves.iter().enumerate() {
            if slave.enabled {
                return Some(i);
            }
            if let Some(expires) = slave.delay_expires {
                if best.map_or(true, |(_, b)| expires < b)
                    && self.lacp_may_enable(i, ctx.hooks.lacp.as_ref())
                {
                    best = Some((i, expires));
                }
            }
        }

        let (idx, expires) = best?;
        info!(
            slave = %self.slaves[idx].name,
            remaining_ms = expires.saturating_duration_since(ctx.now).as_millis() as u64,
            "Skipping remaining updelay since no other slave is up"
        );
        self.enable_slave(idx, true, moving_active, ctx);
        Some(idx)
    }

    pub(crate) fn choose_active_slave(&mut self, ctx: &mut BondCtx, moving_active: bool) {
        let old = self.active_slave;
        self.active_slave = self.choose_slave(ctx, moving_active);
        self.active_tag = Tag::random();

        match self.active_slave {
            Some(idx) => {
                if old != Some(idx) {
                    ctx.metrics.active_slave_changes.inc();
                }
                info!(port = %self.name, slave = %self.slaves[idx].name, "Active slave is now {}", self.slaves[idx].name);
            }
            None => warn!(port = %self.name, "All slaves disabled, no active slave"),
        }
    }

    /// Sets a slave's enabled flag, cancelling any pending transition.
    ///
    /// `moving_active` is set when this call happens while the active
    /// slave is being replaced, so the replacement does not redo the
    /// failover work of the disable that caused it.
    pub(crate) fn enable_slave(&mut self, idx: usize, enable: bool, moving_active: bool, ctx: &mut BondCtx) {
        let slave = &mut self.slaves[idx];
        slave.delay_expires = None;
        if slave.enabled == enable {
            return;
        }
        slave.enabled = enable;

        if !enable {
            warn!(port = %self.name, slave = %slave.name, "Slave disabled");
            ctx.metrics.slave_disables.inc();
            let tag = slave.tag;
            ctx.revalidate(tag);
            if self.active_slave == Some(idx) {
                ctx.revalidate(self.active_tag);
                self.choose_active_slave(ctx, true);
            }
            self.send_learning_packets(ctx);
        } else {
            warn!(port = %self.name, slave = %slave.name, "Slave enabled");
            ctx.metrics.slave_enables.inc();
            if self.active_slave.is_none() && !moving_active {
                ctx.revalidate(self.no_slaves_tag);
                self.choose_active_slave(ctx, false);
                self.send_learning_packets(ctx);
            }
            self.slaves[idx].tag = Tag::random();
        }
    }

    // ========================================
    // Link health
    // ========================================

    /// Feeds one link reading into the debounce state machine of slave
    /// `idx`. `wants_up` is the raw link state combined with LACP's
    /// permission.
    pub(crate) fn link_status_update(&mut self, idx: usize, wants_up: bool, ctx: &mut BondCtx) {
        let slave = &self.slaves[idx];
        let pending = slave.delay_expires.is_some();
        if (wants_up == slave.enabled) != pending {
            return;
        }
        debug!(slave = %slave.name, "Carrier {}", if wants_up { "detected" } else { "dropped" });

        if wants_up == slave.enabled {
            self.slaves[idx].delay_expires = None;
            info!(
                slave = %self.slaves[idx].name,
                "Will not be {}",
                if wants_up { "disabled" } else { "enabled" }
            );
        } else if wants_up && self.active_slave.is_none() {
            if !self.settings.updelay.is_zero() {
                info!(
                    slave = %self.slaves[idx].name,
                    updelay_ms = self.settings.updelay.as_millis() as u64,
                    "Skipping updelay since no other slave is up"
                );
            }
            self.enable_slave(idx, true, false, ctx);
        } else {
            let delay = if self.lacp_negotiated(ctx.hooks.lacp.as_ref()) {
                std::time::Duration::ZERO
            } else if wants_up {
                self.settings.updelay
            } else {
                self.settings.downdelay
            };
            self.slaves[idx].delay_expires = Some(ctx.now + delay);
            if !delay.is_zero() {
                info!(
                    slave = %self.slaves[idx].name,
                    delay_ms = delay.as_millis() as u64,
                    "Will be {} if it stays {}",
                    if wants_up { "enabled" } else { "disabled" },
                    if wants_up { "up" } else { "down" }
                );
            }
        }
    }

    /// Completes every transition whose deadline has passed
    pub(crate) fn run_link_deadlines(&mut self, ctx: &mut BondCtx) {
        for idx in 0..self.slaves.len() {
            let slave = &self.slaves[idx];
            if slave.delay_expires.is_some_and(|at| ctx.now >= at) {
                let enable = !slave.enabled;
                self.enable_slave(idx, enable, false, ctx);
            }
        }
    }

    // ========================================
    // Learning packets
    // ========================================

    /// Re-announces every MAC learned elsewhere out of the slave this bond
    /// would use for it, so upstream switches relearn after a failover.
    pub(crate) fn send_learning_packets(&mut self, ctx: &mut BondCtx) {
        if self.slaves.is_empty() || self.active_slave.is_none() {
            return;
        }

        let mut n_packets = 0usize;
        let mut n_errors = 0usize;
        let mut last_error = None;
        for entry in ctx.ml.entries() {
            if entry.port == self.id {
                continue;
            }
            let mut tags = TagSet::new();
            let flow = FlowKey::l2(0, entry.mac, MacAddr::BROADCAST, VlanTci::NONE);
            let Some(ofport) = self.select_slave(&flow, entry.vlan, &mut tags, ctx) else {
                continue;
            };
            let announcement = Announcement {
                mac: entry.mac,
                vlan: (entry.vlan != 0 && entry.vlan != VLAN_NONE).then_some(entry.vlan),
                ofport,
            };
            n_packets += 1;
            match ctx.hooks.sender.send(&announcement) {
                Ok(()) => ctx.metrics.learning_packets_sent.inc(),
                Err(e) => {
                    n_errors += 1;
                    ctx.metrics.learning_packet_errors.inc();
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            warn!(
                bond = %self.name,
                "{} errors sending {} gratuitous learning packets, last error was: {}",
                n_errors, n_packets, e
            );
        } else {
            debug!(bond = %self.name, "Sent {} gratuitous learning packets", n_packets);
        }
    }

    // ========================================
    // Administration
    // ========================================

    /// Moves `bucket` to slave `idx`
    pub(crate) fn migrate_bucket(&mut self, bucket: usize, idx: usize, ctx: &mut BondCtx) -> bool {
        let Some(entry) = self.bond_table.as_mut().map(|t| &mut t[bucket & BOND_MASK as usize]) else {
            return false;
        };
        let old_tag = entry.tag;
        entry.slave = Some(idx);
        entry.tag = Tag::random();
        ctx.revalidate(old_tag);
        ctx.metrics.bucket_migrations.inc();
        true
    }

    /// Makes enabled slave `idx` the active one. Returns false if it
    /// already was.
    pub(crate) fn set_active_slave(&mut self, idx: usize, ctx: &mut BondCtx) -> bool {
        if self.active_slave == Some(idx) {
            return false;
        }
        ctx.revalidate(self.active_tag);
        self.active_slave = Some(idx);
        self.active_tag = Tag::random();
        ctx.metrics.active_slave_changes.inc();
        info!(port = %self.name, slave = %self.slaves[idx].name, "Active slave is now {}", self.slaves[idx].name);
        self.send_learning_packets(ctx);
        true
    }
}
