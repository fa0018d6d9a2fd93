//! The bridge
//!
//! Owns the ports, mirrors and learning table of one software switch and
//! ties the dataplane components into a single forwarding pipeline:
//! admission, learning, destination lookup and fan-out. Also carries the
//! reconfiguration path and the periodic link-health and load-balancing
//! ticks.

use super::admission::{self, Admitted, Inadmissible};
use super::bond::BondCtx;
use super::compose::{compose_dsts, Egress};
use super::dst::{DestinationSet, OdpAction};
use super::fdb::{Fdb, GratArpLock, MacLearning};
use super::flow::FlowKey;
use super::hooks::Hooks;
use super::mirror::{Mirror, MirrorSet};
use super::port::{BondSettings, LinkDetect, Port, PortId, PortVlanConfig, Slave};
use super::tag::{Tag, TagSet};
use super::vlan::{self, VlanBitmap};
use crate::config::{validate, Config, MirrorConfig, PortConfig, SlaveConfig, VLAN_MAX};
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of running a flow through the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub dsts: DestinationSet,
    pub actions: Vec<OdpAction>,
    /// Revalidating any of these tags must recompute this decision
    pub tags: TagSet,
    /// Why the flow was refused, if it was
    pub dropped: Option<Inadmissible>,
}

impl Decision {
    fn refused(reason: Inadmissible, tags: TagSet) -> Self {
        Self {
            dsts: DestinationSet::new(),
            actions: Vec::new(),
            tags,
            dropped: Some(reason),
        }
    }

    /// True if no copy of the packet leaves the bridge
    pub fn is_drop(&self) -> bool {
        self.actions.is_empty()
    }
}

/// One software Ethernet switch
pub struct Bridge {
    pub(super) name: String,
    pub(super) ports: Vec<Port>,
    pub(super) mirrors: MirrorSet,
    pub(super) ml: Box<dyn MacLearning>,
    pub(super) hooks: Hooks,
    pub(super) metrics: Arc<MetricsRegistry>,
    next_port_id: PortId,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.name)
            .field("ports", &self.ports.len())
            .field("mirrors", &self.mirrors.len())
            .field("macs", &self.ml.len())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Create an empty bridge with the default learning table
    pub fn new(name: impl Into<String>, hooks: Hooks, metrics: Arc<MetricsRegistry>) -> Self {
        Self::with_learning(name, Box::new(Fdb::default()), hooks, metrics)
    }

    /// Create an empty bridge around a custom learning table
    pub fn with_learning(
        name: impl Into<String>,
        ml: Box<dyn MacLearning>,
        hooks: Hooks,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
            mirrors: MirrorSet::new(),
            ml,
            hooks,
            metrics,
            next_port_id: 1,
        }
    }

    /// Build a bridge from a validated configuration
    pub fn from_config(config: &Config, hooks: Hooks, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        let diagnostics = validate(config);
        if diagnostics.has_errors() {
            return Err(Error::Config(diagnostics.errors.join("; ")));
        }

        let ml = Fdb::new(Duration::from_secs(config.bridge.mac_aging_secs));
        let mut bridge = Self::with_learning(&config.bridge.name, Box::new(ml), hooks, metrics);
        bridge.reconfigure(config)?;

        info!(
            bridge = %bridge.name,
            ports = bridge.ports.len(),
            mirrors = bridge.mirrors.len(),
            "Bridge created"
        );
        Ok(bridge)
    }

    // ========================================
    // Accessors
    // ========================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn mirrors(&self) -> &MirrorSet {
        &self.mirrors
    }

    pub fn learning(&self) -> &dyn MacLearning {
        self.ml.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub(super) fn find_port(&self, name: &str) -> Result<usize> {
        self.ports
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| Error::PortNotFound {
                name: name.to_string(),
            })
    }

    fn port_index_by_id(&self, id: PortId) -> Option<usize> {
        self.ports.iter().position(|p| p.id == id)
    }

    /// Borrows the ports alongside everything bond operations touch
    fn split(&mut self, now: Instant) -> (&mut Vec<Port>, &MirrorSet, BondCtx<'_>) {
        let ctx = BondCtx {
            hooks: &mut self.hooks,
            ml: self.ml.as_ref(),
            metrics: self.metrics.as_ref(),
            now,
        };
        (&mut self.ports, &self.mirrors, ctx)
    }

    pub(super) fn with_port<R>(
        &mut self,
        idx: usize,
        now: Instant,
        f: impl FnOnce(&mut Port, &mut BondCtx) -> R,
    ) -> R {
        let (ports, _, mut ctx) = self.split(now);
        f(&mut ports[idx], &mut ctx)
    }

    fn revalidate(&mut self, tag: Tag) {
        self.metrics.revalidations.inc();
        self.hooks.revalidator.revalidate(tag);
    }

    /// Every cached decision on this bridge is suspect
    fn flush(&mut self) {
        self.metrics.revalidations.inc();
        self.hooks.revalidator.revalidate_all();
    }

    // ========================================
    // Reconfiguration
    // ========================================

    /// Applies `config`, adding, removing and updating ports, slaves and
    /// mirrors to match it. MAC aging is fixed at creation.
    pub fn reconfigure(&mut self, config: &Config) -> Result<()> {
        let stale_ports: Vec<String> = self
            .ports
            .iter()
            .filter(|p| !config.ports.iter().any(|c| c.name == p.name))
            .map(|p| p.name.clone())
            .collect();
        for name in stale_ports {
            self.remove_port(&name)?;
        }

        // Drop moved or renumbered slaves everywhere before adding any, so
        // a slave can change ports in one pass.
        for cfg in &config.ports {
            let Some(port) = self.port(&cfg.name) else {
                continue;
            };
            let stale_slaves: Vec<String> = port
                .slaves
                .iter()
                .filter(|s| !cfg.slaves.iter().any(|c| c.name == s.name && c.ofport == s.ofport))
                .map(|s| s.name.clone())
                .collect();
            for slave in stale_slaves {
                self.remove_slave(&cfg.name, &slave)?;
            }
        }

        for cfg in &config.ports {
            let Ok(idx) = self.find_port(&cfg.name) else {
                self.add_port(cfg)?;
                continue;
            };
            let mut flood_changed = false;
            for slave_cfg in &cfg.slaves {
                match self.ports[idx].slave_index(&slave_cfg.name) {
                    Some(s) => {
                        let slave = &mut self.ports[idx].slaves[s];
                        flood_changed |= slave.no_flood != slave_cfg.no_flood;
                        slave.no_flood = slave_cfg.no_flood;
                    }
                    None => self.add_slave(&cfg.name, slave_cfg)?,
                }
            }
            if flood_changed {
                self.flush();
            }
            self.set_port_vlan_mode(&cfg.name, cfg.vlan_config())?;
            self.set_bond_settings(&cfg.name, cfg.bond_settings())?;
        }

        let stale_mirrors: Vec<String> = self
            .mirrors
            .iter()
            .filter(|(_, m)| !config.mirrors.iter().any(|c| c.name == m.name))
            .map(|(_, m)| m.name.clone())
            .collect();
        for name in stale_mirrors {
            self.remove_mirror(&name);
        }
        for mirror in &config.mirrors {
            self.set_mirror(mirror)?;
        }

        let flood_vlans: Vec<u16> = config
            .bridge
            .flood_vlans
            .iter()
            .copied()
            .filter(|v| *v <= VLAN_MAX)
            .collect();
        self.set_flood_vlans((!flood_vlans.is_empty()).then(|| VlanBitmap::from_vlans(flood_vlans)));

        Ok(())
    }

    fn slave_in_use(&self, cfg: &SlaveConfig) -> bool {
        self.ports
            .iter()
            .flat_map(|p| p.slaves.iter())
            .any(|s| s.name == cfg.name || s.ofport == cfg.ofport)
    }

    fn new_slave(&self, detect: LinkDetect, cfg: &SlaveConfig) -> Slave {
        let carrier = match detect {
            LinkDetect::Carrier => self.hooks.carrier.get_carrier(&cfg.name),
            LinkDetect::Miimon => self.hooks.carrier.get_miimon(&cfg.name),
        };
        let mut slave = Slave::new(&cfg.name, cfg.ofport, carrier);
        slave.no_flood = cfg.no_flood;
        slave
    }

    /// Create a port with its slaves
    pub fn add_port(&mut self, cfg: &PortConfig) -> Result<()> {
        if self.port(&cfg.name).is_some() {
            return Err(Error::Config(format!("port {} already exists", cfg.name)));
        }
        if cfg.slaves.is_empty() {
            return Err(Error::Config(format!("port {} has no slaves", cfg.name)));
        }

        let id = self.next_port_id;
        let settings = cfg.bond_settings();
        let mut port = Port::new(id, &cfg.name, cfg.vlan_config(), settings);
        for slave_cfg in &cfg.slaves {
            if self.slave_in_use(slave_cfg)
                || port.slave_index(&slave_cfg.name).is_some()
                || port.slave_by_ofport(slave_cfg.ofport).is_some()
            {
                return Err(Error::DuplicateSlave {
                    slave: slave_cfg.name.clone(),
                });
            }
            port.slaves.push(self.new_slave(settings.detect, slave_cfg));
        }
        port.update_vlan_mode();
        self.next_port_id += 1;

        for slave_cfg in &cfg.slaves {
            self.metrics.register_slave(&slave_cfg.name);
        }
        self.ports.push(port);
        let idx = self.ports.len() - 1;
        self.with_port(idx, Instant::now(), |port, ctx| {
            port.update_bond_table(ctx.now);
            if port.is_bond() {
                port.choose_active_slave(ctx, false);
            }
        });

        info!(bridge = %self.name, port = %cfg.name, slaves = cfg.slaves.len(), "Created port");
        self.mirrors.apply(&mut self.ports);
        self.flush();
        Ok(())
    }

    /// Destroy a port, the mirrors that output to it and the MACs learned
    /// on it
    pub fn remove_port(&mut self, name: &str) -> Result<()> {
        let idx = self.find_port(name)?;
        let port = self.ports.remove(idx);

        for mirror in self.mirrors.remove_output_port(port.id) {
            info!(bridge = %self.name, mirror = %mirror, "Destroyed mirror whose output port was removed");
        }
        for tag in self.ml.flush_port(port.id) {
            self.revalidate(tag);
        }
        for slave in &port.slaves {
            self.metrics.unregister_slave(&slave.name);
        }
        self.metrics.set_mac_table_size(self.ml.len());

        info!(bridge = %self.name, port = %name, "Destroyed port");
        self.mirrors.apply(&mut self.ports);
        self.flush();
        Ok(())
    }

    /// Add a slave to an existing port, bonding it if this is the second
    pub fn add_slave(&mut self, port: &str, cfg: &SlaveConfig) -> Result<()> {
        let idx = self.find_port(port)?;
        if self.slave_in_use(cfg) {
            return Err(Error::DuplicateSlave {
                slave: cfg.name.clone(),
            });
        }

        let slave = self.new_slave(self.ports[idx].settings.detect, cfg);
        self.ports[idx].slaves.push(slave);
        self.metrics.register_slave(&cfg.name);

        self.with_port(idx, Instant::now(), |port, ctx| {
            port.update_vlan_mode();
            let new_table = port.update_bond_table(ctx.now);
            if port.is_bond() && (new_table || port.active_slave.is_none()) {
                port.choose_active_slave(ctx, false);
            }
        });

        info!(bridge = %self.name, port = %port, slave = %cfg.name, "Added slave");
        self.mirrors.apply(&mut self.ports);
        self.flush();
        Ok(())
    }

    /// Remove a slave. Removing the last slave destroys the port.
    pub fn remove_slave(&mut self, port: &str, slave: &str) -> Result<()> {
        let idx = self.find_port(port)?;
        let Some(s) = self.ports[idx].slave_index(slave) else {
            return Err(Error::SlaveNotFound {
                port: port.to_string(),
                slave: slave.to_string(),
            });
        };

        if self.ports[idx].slaves.len() == 1 {
            warn!(bridge = %self.name, port = %port, "Port has no slaves, dropping");
            return self.remove_port(port);
        }

        self.with_port(idx, Instant::now(), |port, ctx| {
            let was_active = port.active_slave == Some(s);
            let (removed, orphaned) = port.detach_slave(s);
            ctx.revalidate(removed.tag);
            for tag in orphaned {
                ctx.revalidate(tag);
            }
            port.update_vlan_mode();
            port.update_bond_table(ctx.now);
            if was_active {
                ctx.revalidate(port.active_tag);
                port.choose_active_slave(ctx, false);
                port.send_learning_packets(ctx);
            }
        });
        self.metrics.unregister_slave(slave);

        info!(bridge = %self.name, port = %port, slave = %slave, "Removed slave");
        self.mirrors.apply(&mut self.ports);
        self.flush();
        Ok(())
    }

    /// Change a port's access tag or trunk list. Returns true if anything
    /// changed.
    pub fn set_port_vlan_mode(&mut self, port: &str, vlan: PortVlanConfig) -> Result<bool> {
        let idx = self.find_port(port)?;
        let port = &mut self.ports[idx];
        if port.vlan_config == vlan {
            return Ok(false);
        }
        port.vlan_config = vlan;
        port.update_vlan_mode();
        debug!(bridge = %self.name, port = %port.name, mode = ?port.vlan_mode, "VLAN mode changed");

        self.mirrors.apply(&mut self.ports);
        self.flush();
        Ok(true)
    }

    /// Change a port's bonding parameters. Returns true if anything
    /// changed.
    pub fn set_bond_settings(&mut self, port: &str, settings: BondSettings) -> Result<bool> {
        let idx = self.find_port(port)?;
        let settings = settings.normalized();
        if self.ports[idx].settings == settings {
            return Ok(false);
        }

        self.with_port(idx, Instant::now(), |port, ctx| {
            let interval_changed = port.settings.rebalance_interval != settings.rebalance_interval;
            port.settings = settings;
            if interval_changed && port.next_rebalance.is_some() {
                port.next_rebalance = Some(ctx.now + settings.rebalance_interval);
            }
            if port.update_bond_table(ctx.now) && port.bond_table.is_some() {
                port.choose_active_slave(ctx, false);
            }
        });

        debug!(bridge = %self.name, port = %port, mode = %settings.mode, "Bond settings changed");
        self.flush();
        Ok(true)
    }

    /// Create or reconfigure a mirror by name. A mirror without an output
    /// is destroyed.
    pub fn set_mirror(&mut self, cfg: &MirrorConfig) -> Result<()> {
        let Some(mirror) = Mirror::from_config(cfg, &self.ports)? else {
            self.remove_mirror(&cfg.name);
            return Ok(());
        };

        let (slot, changed) = self.mirrors.upsert(mirror)?;
        if changed {
            info!(bridge = %self.name, mirror = %cfg.name, slot, "Configured mirror");
            self.mirrors.apply(&mut self.ports);
            self.flush();
        }
        Ok(())
    }

    /// Destroy a mirror. Returns false if there was none by that name.
    pub fn remove_mirror(&mut self, name: &str) -> bool {
        let Some(slot) = self.mirrors.find(name) else {
            return false;
        };
        self.mirrors.remove(slot);
        info!(bridge = %self.name, mirror = %name, "Destroyed mirror");
        self.mirrors.apply(&mut self.ports);
        self.flush();
        true
    }

    /// Disable MAC learning on `vlans` (RSPAN VLANs). Returns true if the
    /// set changed.
    pub fn set_flood_vlans(&mut self, vlans: Option<VlanBitmap>) -> bool {
        if !self.ml.set_flood_vlans(vlans) {
            return false;
        }
        self.metrics.set_mac_table_size(self.ml.len());
        self.flush();
        true
    }

    // ========================================
    // Forwarding
    // ========================================

    /// Computes what to do with `flow`.
    ///
    /// `have_packet` is true for a packet just received and false when
    /// revalidating a cached decision. Returns `None` when a revalidated
    /// unicast flow has no learned destination and should be ejected
    /// from the cache rather than flooded.
    pub fn process_flow(&mut self, flow: &FlowKey, have_packet: bool) -> Option<Decision> {
        let mut tags = TagSet::new();
        let admitted = match admission::check(
            &self.name,
            &self.ports,
            self.ml.as_ref(),
            self.hooks.lacp.as_ref(),
            flow,
            have_packet,
            &mut tags,
        ) {
            Ok(admitted) => admitted,
            Err(reason) => {
                self.metrics.record_drop(reason.reason());
                debug!(bridge = %self.name, ofport = flow.in_port, "Dropping flow: {}", reason);
                return Some(self.refuse(flow, reason, tags));
            }
        };
        self.metrics.flows_admitted.inc();

        if have_packet {
            self.update_learning_table(flow, &admitted);
        }

        let out = self
            .ml
            .lookup_tag(flow.dl_dst, admitted.vlan, &mut tags)
            .and_then(|id| self.port_index_by_id(id));
        let egress = match out {
            Some(idx) if idx == admitted.port => Egress::None,
            Some(idx) => Egress::Port(idx),
            // Flooding here would open a window in which a reflection
            // over a bond could be learned and blackhole the flow.
            None if !have_packet && !flow.dl_dst.is_multicast() => {
                self.metrics.flows_ejected.inc();
                return None;
            }
            None => Egress::Flood,
        };

        let (ports, mirrors, mut ctx) = self.split(Instant::now());
        let dsts = compose_dsts(
            ports,
            mirrors,
            flow,
            admitted.vlan,
            admitted.port,
            egress,
            &mut tags,
            &mut ctx,
        );
        self.metrics.destinations_composed.add(dsts.len() as u64);

        let actions = dsts.to_actions(flow.vlan_tci);
        Some(Decision {
            dsts,
            actions,
            tags,
            dropped: None,
        })
    }

    /// Decision for a refused flow. Mirrors selecting the ingress port
    /// still see it, as long as its port and VLAN resolved and the port
    /// is not itself a mirror output.
    fn refuse(&mut self, flow: &FlowKey, reason: Inadmissible, mut tags: TagSet) -> Decision {
        let ingress = match reason {
            Inadmissible::UnknownIngress { .. }
            | Inadmissible::Vlan(_)
            | Inadmissible::MirrorOutputPort => None,
            _ => admission::find_slave(&self.ports, flow.in_port).and_then(|(idx, _)| {
                vlan::resolve(flow, &self.ports[idx].vlan_mode)
                    .ok()
                    .map(|vlan| (idx, vlan))
            }),
        };
        let Some((in_idx, vlan)) = ingress else {
            return Decision::refused(reason, tags);
        };

        let (ports, mirrors, mut ctx) = self.split(Instant::now());
        let dsts = compose_dsts(
            ports,
            mirrors,
            flow,
            vlan,
            in_idx,
            Egress::None,
            &mut tags,
            &mut ctx,
        );
        self.metrics.destinations_composed.add(dsts.len() as u64);

        let actions = dsts.to_actions(flow.vlan_tci);
        Decision {
            dsts,
            actions,
            tags,
            dropped: Some(reason),
        }
    }

    fn update_learning_table(&mut self, flow: &FlowKey, admitted: &Admitted) {
        if !self.ml.may_learn(flow.dl_src, admitted.vlan) {
            return;
        }

        let port = &self.ports[admitted.port];
        // Reflections of a gratuitous ARP over another bond slave must not
        // undo what the original taught us.
        let lock = if !flow.is_gratuitous_arp() {
            GratArpLock::None
        } else if port.slaves.len() == 1 {
            GratArpLock::Set
        } else {
            GratArpLock::Check
        };

        if let Some(tag) = self.ml.learn(flow.dl_src, admitted.vlan, port.id, lock) {
            debug!(
                bridge = %self.name,
                mac = %flow.dl_src,
                port = %self.ports[admitted.port].name,
                vlan = admitted.vlan,
                "Learned MAC location"
            );
            self.metrics.macs_learned.inc();
            self.revalidate(tag);
        }
        self.metrics.set_mac_table_size(self.ml.len());
    }

    /// Feeds datapath statistics for a cached flow back into the bridge.
    ///
    /// `tags` and `actions` are those of the flow's decision. Learning is
    /// refreshed only for flows that went through the normal pipeline
    /// (which always produces tags). Bytes sent out hash bonds are added
    /// to the bucket the flow hashes to.
    pub fn account_flow(&mut self, flow: &FlowKey, tags: &TagSet, actions: &[OdpAction], n_bytes: u64) {
        let mut scratch = TagSet::new();
        let admitted = admission::check(
            &self.name,
            &self.ports,
            self.ml.as_ref(),
            self.hooks.lacp.as_ref(),
            flow,
            false,
            &mut scratch,
        );
        if !tags.is_empty() {
            if let Ok(admitted) = &admitted {
                self.update_learning_table(flow, admitted);
            }
        }

        let vlan = match &admitted {
            Ok(admitted) => admitted.vlan,
            Err(_) => admission::find_slave(&self.ports, flow.in_port)
                .and_then(|(p, _)| vlan::resolve(flow, &self.ports[p].vlan_mode).ok())
                .unwrap_or_else(|| flow.wire_vlan()),
        };

        for action in actions {
            let OdpAction::Output(ofport) = *action else {
                continue;
            };
            let Some((p, s)) = admission::find_slave(&self.ports, ofport) else {
                continue;
            };
            let port = &mut self.ports[p];
            self.metrics.record_tx(&port.slaves[s].name, n_bytes);
            if port.bond_table.is_none() {
                continue;
            }
            let negotiated = port.lacp_negotiated(self.hooks.lacp.as_ref());
            let bucket = port.bucket_index(flow, vlan, negotiated);
            if let Some(table) = port.bond_table.as_mut() {
                table[bucket].tx_bytes += n_bytes;
            }
        }
    }

    // ========================================
    // Periodic work
    // ========================================

    /// Polls every bond slave's link and advances its debounce state
    pub fn tick_link_health(&mut self, now: Instant) {
        let (ports, _, mut ctx) = self.split(now);
        for port in ports.iter_mut().filter(|p| p.is_bond()) {
            for idx in 0..port.slaves.len() {
                let name = &port.slaves[idx].name;
                let raw = match port.settings.detect {
                    LinkDetect::Carrier => ctx.hooks.carrier.get_carrier(name),
                    LinkDetect::Miimon => ctx.hooks.carrier.get_miimon(name),
                };
                if raw != port.slaves[idx].carrier {
                    ctx.hooks
                        .lacp
                        .notify_carrier_changed(&port.name, &port.slaves[idx].name);
                    port.slaves[idx].carrier = raw;
                }
                let wants_up = raw && port.lacp_may_enable(idx, ctx.hooks.lacp.as_ref());
                port.link_status_update(idx, wants_up, &mut ctx);
            }
            port.run_link_deadlines(&mut ctx);
        }
    }

    /// Rebalances every hash bond whose interval has elapsed
    pub fn tick_load_balance(&mut self, now: Instant) {
        let (ports, _, mut ctx) = self.split(now);
        for port in ports.iter_mut() {
            let due = port.bond_table.is_some() && port.next_rebalance.is_some_and(|at| now >= at);
            if !due {
                continue;
            }
            port.next_rebalance = Some(now + port.settings.rebalance_interval);
            port.rebalance(&mut ctx);
        }
    }

    /// Ages out idle MACs. Returns how many were forgotten.
    pub fn expire_macs(&mut self) -> usize {
        let tags = self.ml.expire();
        for tag in &tags {
            self.revalidate(*tag);
        }
        self.metrics.set_mac_table_size(self.ml.len());
        if !tags.is_empty() {
            debug!(bridge = %self.name, expired = tags.len(), "Aged out MAC entries");
        }
        tags.len()
    }
}
