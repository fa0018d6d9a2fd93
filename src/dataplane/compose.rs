//! Fan-out composition
//!
//! Turns a flow and its egress decision into the full set of output
//! copies: the unicast or flooded destinations plus every copy the
//! mirrors selecting them ask for. Refused flows compose with no egress,
//! so only source mirrors of their ingress port apply.

use super::bond::BondCtx;
use super::dst::{Destination, DestinationSet};
use super::flow::{FlowKey, VLAN_NONE};
use super::mirror::{MirrorOutput, MirrorSet};
use super::port::Port;
use super::tag::TagSet;

/// Where the learning table sends a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Egress {
    /// Nowhere (destination is the ingress port, or the flow was
    /// refused). Mirrors still apply.
    None,
    /// Every eligible port except ingress
    Flood,
    /// Port at this index
    Port(usize),
}

/// Builds the copy for `out` of a flow in `vlan`.
///
/// The copy is untagged out of access ports. Out of trunks it carries the
/// ingress access VLAN when there is one, otherwise the wire VLAN.
fn set_dst(
    flow: &FlowKey,
    vlan: u16,
    in_access: Option<u16>,
    out: &mut Port,
    tags: &mut TagSet,
    ctx: &mut BondCtx,
) -> Option<Destination> {
    let dst_vlan = if out.vlan_mode.is_access() {
        VLAN_NONE
    } else if let Some(access) = in_access {
        access
    } else {
        flow.wire_vlan()
    };
    let ofport = out.select_slave(flow, vlan, tags, ctx)?;
    Some(Destination {
        vlan: dst_vlan,
        ofport,
    })
}

/// Composes every destination of a flow admitted in `vlan` on port
/// `in_idx`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compose_dsts(
    ports: &mut [Port],
    mirrors: &MirrorSet,
    flow: &FlowKey,
    vlan: u16,
    in_idx: usize,
    egress: Egress,
    tags: &mut TagSet,
    ctx: &mut BondCtx,
) -> DestinationSet {
    let in_access = ports[in_idx].vlan_mode.access_vlan();
    let mut mirror_mask = ports[in_idx].src_mirrors;
    let mut dsts = DestinationSet::new();

    match egress {
        Egress::None => {}
        Egress::Flood => {
            for (i, port) in ports.iter_mut().enumerate() {
                if i == in_idx
                    || !port.includes_vlan(vlan)
                    || port.is_mirror_output
                    || !port.is_floodable()
                {
                    continue;
                }
                if let Some(dst) = set_dst(flow, vlan, in_access, port, tags, ctx) {
                    dsts.push(dst);
                    mirror_mask |= port.dst_mirrors;
                }
            }
        }
        Egress::Port(out) => {
            let port = &mut ports[out];
            if let Some(dst) = set_dst(flow, vlan, in_access, port, tags, ctx) {
                dsts.push(dst);
                mirror_mask |= port.dst_mirrors;
            }
        }
    }

    let wire_vlan = flow.wire_vlan();
    for idx in mirror_mask.iter() {
        let Some(mirror) = mirrors.get(idx) else {
            continue;
        };
        if !mirror.vlan_is_mirrored(vlan) {
            continue;
        }
        match mirror.output {
            MirrorOutput::Port(id) => {
                let Some(port) = ports.iter_mut().find(|p| p.id == id) else {
                    continue;
                };
                if let Some(dst) = set_dst(flow, vlan, in_access, port, tags, ctx) {
                    dsts.push(dst);
                }
            }
            MirrorOutput::Vlan(out_vlan) => {
                for (j, port) in ports.iter_mut().enumerate() {
                    if !port.includes_vlan(out_vlan) {
                        continue;
                    }
                    let Some(mut dst) = set_dst(flow, vlan, in_access, port, tags, ctx) else {
                        continue;
                    };
                    if !port.vlan_mode.is_access() {
                        dst.vlan = out_vlan;
                    }
                    // Never reflect back out the ingress port on the
                    // VLAN the packet arrived with.
                    if j == in_idx && dst.vlan == wire_vlan {
                        continue;
                    }
                    dsts.push(dst);
                }
            }
        }
    }

    dsts.partition(wire_vlan);
    dsts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::dst::OdpAction;
    use crate::dataplane::fdb::Fdb;
    use crate::dataplane::hooks::Hooks;
    use crate::dataplane::mirror::Mirror;
    use crate::dataplane::port::{BondSettings, PortVlanConfig, Slave};
    use crate::dataplane::vlan::VlanBitmap;
    use crate::protocol::{MacAddr, VlanTci};
    use crate::telemetry::MetricsRegistry;
    use std::collections::BTreeSet;
    use std::time::Instant;

    const SRC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
    const DST: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

    struct Env {
        hooks: Hooks,
        ml: Fdb,
        metrics: MetricsRegistry,
    }

    impl Env {
        fn new() -> Self {
            Self {
                hooks: Hooks::default(),
                ml: Fdb::default(),
                metrics: MetricsRegistry::new(),
            }
        }

        fn ctx(&mut self) -> BondCtx<'_> {
            BondCtx {
                hooks: &mut self.hooks,
                ml: &self.ml,
                metrics: &self.metrics,
                now: Instant::now(),
            }
        }
    }

    fn port(id: u32, tag: Option<u16>, trunks: Option<&[u16]>) -> Port {
        let mut port = Port::new(
            id,
            format!("p{}", id),
            PortVlanConfig {
                tag,
                trunks: trunks.map(|t| VlanBitmap::from_vlans(t.iter().copied())),
            },
            BondSettings::default(),
        );
        port.slaves.push(Slave::new(format!("eth{}", id), id as u16, true));
        port
    }

    fn vlan_mirror(name: &str, src: &[&str], out_vlan: u16) -> Mirror {
        Mirror {
            name: name.to_string(),
            src_ports: src.iter().map(|s| s.to_string()).collect(),
            dst_ports: BTreeSet::new(),
            vlans: None,
            output: MirrorOutput::Vlan(out_vlan),
        }
    }

    fn compose(
        env: &mut Env,
        ports: &mut [Port],
        mirrors: &MirrorSet,
        flow: &FlowKey,
        vlan: u16,
        in_idx: usize,
        egress: Egress,
    ) -> DestinationSet {
        let mut tags = TagSet::new();
        compose_dsts(ports, mirrors, flow, vlan, in_idx, egress, &mut tags, &mut env.ctx())
    }

    fn ofports(dsts: &DestinationSet) -> Vec<u16> {
        let mut v: Vec<u16> = dsts.iter().map(|d| d.ofport).collect();
        v.sort();
        v
    }

    // ========================================
    // Unicast and flood
    // ========================================

    #[test]
    fn test_access_to_trunk_tags_copy() {
        let mut env = Env::new();
        let mut ports = vec![port(1, Some(5), None), port(2, None, None)];
        let flow = FlowKey::l2(1, SRC, DST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &MirrorSet::new(), &flow, 5, 0, Egress::Port(1));

        assert_eq!(dsts.as_slice(), &[Destination { vlan: 5, ofport: 2 }]);
        assert_eq!(
            dsts.to_actions(flow.vlan_tci),
            vec![OdpAction::SetVlan(VlanTci::new(5, 0)), OdpAction::Output(2)]
        );
    }

    #[test]
    fn test_trunk_to_access_strips() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, Some(7), None)];
        let flow = FlowKey::l2(1, SRC, DST, VlanTci::new(7, 3));
        let dsts = compose(&mut env, &mut ports, &MirrorSet::new(), &flow, 7, 0, Egress::Port(1));

        assert_eq!(dsts.as_slice(), &[Destination { vlan: VLAN_NONE, ofport: 2 }]);
        assert_eq!(
            dsts.to_actions(flow.vlan_tci),
            vec![OdpAction::StripVlan, OdpAction::Output(2)]
        );
    }

    #[test]
    fn test_flood_respects_vlan_membership() {
        let mut env = Env::new();
        let mut ports = vec![
            port(1, Some(10), None),
            port(2, Some(10), None),
            port(3, Some(20), None),
            port(4, None, Some(&[10])),
            port(5, None, Some(&[20])),
        ];
        let flow = FlowKey::l2(1, SRC, MacAddr::BROADCAST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &MirrorSet::new(), &flow, 10, 0, Egress::Flood);

        assert_eq!(ofports(&dsts), vec![2, 4]);
        assert!(!dsts.contains_port(1));
    }

    #[test]
    fn test_flood_skips_mirror_output_and_no_flood() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, None, None), port(3, None, None), port(4, None, None)];
        ports[2].is_mirror_output = true;
        ports[3].slaves[0].no_flood = true;
        let flow = FlowKey::l2(1, SRC, MacAddr::BROADCAST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &MirrorSet::new(), &flow, VLAN_NONE, 0, Egress::Flood);

        assert_eq!(ofports(&dsts), vec![2]);
    }

    #[test]
    fn test_no_egress_without_mirrors_is_empty() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, None, None)];
        let flow = FlowKey::l2(1, SRC, DST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &MirrorSet::new(), &flow, VLAN_NONE, 0, Egress::None);
        assert!(dsts.is_empty());
    }

    // ========================================
    // Mirrors
    // ========================================

    #[test]
    fn test_mirror_to_vlan_retags_trunks() {
        let mut env = Env::new();
        let mut ports = vec![
            port(3, Some(7), None),
            port(4, Some(7), None),
            port(5, None, Some(&[99])),
            port(6, Some(99), None),
            port(7, None, Some(&[7])),
        ];
        let mut mirrors = MirrorSet::new();
        mirrors.upsert(vlan_mirror("m", &["p3"], 99)).unwrap();
        mirrors.apply(&mut ports);

        let flow = FlowKey::l2(3, SRC, DST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &mirrors, &flow, 7, 0, Egress::Port(1));

        assert!(dsts.contains(&Destination { vlan: VLAN_NONE, ofport: 4 }));
        assert!(dsts.contains(&Destination { vlan: 99, ofport: 5 }));
        assert!(dsts.contains(&Destination { vlan: VLAN_NONE, ofport: 6 }));
        assert!(!dsts.contains_port(7));
        assert_eq!(dsts.len(), 3);
    }

    #[test]
    fn test_mirror_to_port_deduplicated() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, None, None), port(3, None, None)];
        let mut mirrors = MirrorSet::new();
        for name in ["a", "b"] {
            mirrors
                .upsert(Mirror {
                    name: name.to_string(),
                    src_ports: ["p1".to_string()].into_iter().collect(),
                    dst_ports: BTreeSet::new(),
                    vlans: None,
                    output: MirrorOutput::Port(3),
                })
                .unwrap();
        }
        mirrors.apply(&mut ports);

        let flow = FlowKey::l2(1, SRC, DST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &mirrors, &flow, VLAN_NONE, 0, Egress::Port(1));
        assert_eq!(ofports(&dsts), vec![2, 3]);
    }

    #[test]
    fn test_mirror_vlan_filter() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, None, None), port(3, None, None)];
        let mut mirrors = MirrorSet::new();
        mirrors
            .upsert(Mirror {
                name: "only-10".to_string(),
                src_ports: ["p1".to_string()].into_iter().collect(),
                dst_ports: BTreeSet::new(),
                vlans: Some(VlanBitmap::from_vlans([10])),
                output: MirrorOutput::Port(3),
            })
            .unwrap();
        mirrors.apply(&mut ports);

        let in_10 = FlowKey::l2(1, SRC, DST, VlanTci::new(10, 0));
        let dsts = compose(&mut env, &mut ports, &mirrors, &in_10, 10, 0, Egress::Port(1));
        assert!(dsts.contains_port(3));

        let in_20 = FlowKey::l2(1, SRC, DST, VlanTci::new(20, 0));
        let dsts = compose(&mut env, &mut ports, &mirrors, &in_20, 20, 0, Egress::Port(1));
        assert!(!dsts.contains_port(3));
    }

    #[test]
    fn test_dst_mirror_follows_flooded_port() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, None, None), port(3, None, None)];
        let mut mirrors = MirrorSet::new();
        mirrors
            .upsert(Mirror {
                name: "to-p2".to_string(),
                src_ports: BTreeSet::new(),
                dst_ports: ["p2".to_string()].into_iter().collect(),
                vlans: None,
                output: MirrorOutput::Port(3),
            })
            .unwrap();
        mirrors.apply(&mut ports);

        let flow = FlowKey::l2(1, SRC, MacAddr::BROADCAST, VlanTci::NONE);
        let dsts = compose(&mut env, &mut ports, &mirrors, &flow, VLAN_NONE, 0, Egress::Flood);
        // p3 is reserved for the mirror so only gets the mirrored copy
        assert_eq!(ofports(&dsts), vec![2, 3]);
    }

    #[test]
    fn test_mirror_never_reflects_to_ingress() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, None, None)];
        let mut mirrors = MirrorSet::new();
        mirrors.upsert(vlan_mirror("rspan", &["p1"], 99)).unwrap();
        mirrors.apply(&mut ports);

        // Arrived on VLAN 99 already: no copy back out p1
        let flow = FlowKey::l2(1, SRC, DST, VlanTci::new(99, 0));
        let dsts = compose(&mut env, &mut ports, &mirrors, &flow, 99, 0, Egress::Port(1));
        assert!(!dsts.contains_port(1));

        // Arrived on another VLAN: the retagged copy may go back out
        let flow = FlowKey::l2(1, SRC, DST, VlanTci::new(5, 0));
        let dsts = compose(&mut env, &mut ports, &mirrors, &flow, 5, 0, Egress::Port(1));
        assert!(dsts.contains(&Destination { vlan: 99, ofport: 1 }));
    }

    #[test]
    fn test_partition_puts_wire_vlan_first() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, Some(5), None), port(3, None, None), port(4, None, None)];
        let mut mirrors = MirrorSet::new();
        mirrors.upsert(vlan_mirror("rspan", &["p1"], 99)).unwrap();
        mirrors.apply(&mut ports);

        let flow = FlowKey::l2(1, SRC, MacAddr::BROADCAST, VlanTci::new(5, 0));
        let dsts = compose(&mut env, &mut ports, &mirrors, &flow, 5, 0, Egress::Flood);

        let vlans: Vec<u16> = dsts.iter().map(|d| d.vlan).collect();
        let first_other = vlans.iter().position(|v| *v != 5).unwrap_or(vlans.len());
        assert!(vlans[first_other..].iter().all(|v| *v != 5));
        assert!(vlans[..first_other].iter().all(|v| *v == 5));
    }

    #[test]
    fn test_compose_is_idempotent() {
        let mut env = Env::new();
        let mut ports = vec![port(1, None, None), port(2, Some(5), None), port(3, None, Some(&[5, 99]))];
        let mut mirrors = MirrorSet::new();
        mirrors.upsert(vlan_mirror("rspan", &["p1"], 99)).unwrap();
        mirrors.apply(&mut ports);

        let flow = FlowKey::l2(1, SRC, MacAddr::BROADCAST, VlanTci::new(5, 0));
        let first = compose(&mut env, &mut ports, &mirrors, &flow, 5, 0, Egress::Flood);
        let second = compose(&mut env, &mut ports, &mirrors, &flow, 5, 0, Egress::Flood);
        assert_eq!(first, second);
    }
}
