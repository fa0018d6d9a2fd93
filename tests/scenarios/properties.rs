//! Properties that must hold for every flow

use super::*;
use bridgecore::config::{Config, PortConfig};
use bridgecore::dataplane::{bond_hash, BondMode, BOND_BUCKETS};

fn mixed_bridge() -> Harness {
    let mut config = Config::default();
    config.ports.push(trunk("p1", 1, None));
    config.ports.push(trunk("p2", 2, Some(&[10, 20])));
    config.ports.push(access("p3", 3, 10));
    config.ports.push(access("p4", 4, 20));
    let mut bond = PortConfig::new("bond0", vec![slave("eth5", 5), slave("eth6", 6)]);
    bond.bond_mode = BondMode::SourceHash;
    config.ports.push(bond);
    config.mirrors.push(vlan_mirror("m", "p1", 10));
    Harness::new(&config, &[])
}

// ========================================
// Idempotence
// ========================================

#[test]
fn test_decisions_are_idempotent() {
    let mut h = mixed_bridge();
    for vlan in [10u16, 20, 30] {
        for src in 1..=8 {
            let flow = tagged(1, mac(src), MacAddr::BROADCAST, vlan);
            let first = h.bridge.process_flow(&flow, false).unwrap();
            let second = h.bridge.process_flow(&flow, false).unwrap();
            let third = h.bridge.process_flow(&flow, false).unwrap();
            assert_eq!(first.dsts, second.dsts);
            assert_eq!(first.actions, second.actions);
            assert_eq!(second, third);
        }
    }
}

// ========================================
// No self-reflection
// ========================================

#[test]
fn test_ingress_never_receives_its_own_vlan() {
    let mut h = mixed_bridge();
    for vlan in [10u16, 20, 30] {
        for src in 1..=8 {
            let flow = tagged(1, mac(src), MacAddr::BROADCAST, vlan);
            let decision = h.forward(&flow);
            assert!(
                !decision.dsts.iter().any(|d| d.ofport == 1 && d.vlan == vlan),
                "flow in VLAN {} reflected out its ingress",
                vlan
            );
        }
    }
}

#[test]
fn test_vlan_mirror_may_copy_ingress_on_other_vlan() {
    let mut h = mixed_bridge();
    let decision = h.forward(&tagged(1, mac(1), MacAddr::BROADCAST, 20));
    assert!(decision.dsts.iter().any(|d| d.ofport == 1 && d.vlan == 10));
}

// ========================================
// Bond determinism
// ========================================

fn synthetic_flow(i: u32) -> (FlowKey, u16) {
    let b = i.to_be_bytes();
    let src = MacAddr([0x02, 0x5e, b[0], b[1], b[2], b[3]]);
    let vlan = (i % 4094 + 1) as u16;
    (tagged(1, src, MacAddr::BROADCAST, vlan), vlan)
}

fn bond_output(decision: &Decision) -> Option<OfPort> {
    decision
        .dsts
        .iter()
        .map(|d| d.ofport)
        .find(|p| *p == 5 || *p == 6)
}

#[test]
fn test_source_hash_is_deterministic() {
    let mut config = Config::default();
    config.ports.push(trunk("p1", 1, None));
    config.ports.push(PortConfig::new(
        "bond0",
        vec![slave("eth5", 5), slave("eth6", 6)],
    ));
    let mut h = Harness::new(&config, &[]);

    // Pin the table: even buckets on eth5, odd on eth6
    for bucket in 0..BOND_BUCKETS {
        let target = if bucket % 2 == 0 { "eth5" } else { "eth6" };
        h.bridge.bond_migrate("bond0", bucket, target).unwrap();
    }

    let mut first_run = Vec::with_capacity(10_000);
    for i in 0..10_000 {
        let (flow, vlan) = synthetic_flow(i);
        let decision = h.bridge.process_flow(&flow, false).unwrap();
        let out = bond_output(&decision).unwrap();
        let expected = if bond_hash(flow.dl_src, vlan) % 2 == 0 { 5 } else { 6 };
        assert_eq!(out, expected);
        first_run.push(out);
    }

    for i in 0..10_000 {
        let (flow, _) = synthetic_flow(i);
        let decision = h.bridge.process_flow(&flow, false).unwrap();
        assert_eq!(bond_output(&decision), Some(first_run[i as usize]));
    }

    // Both slaves carry a share
    assert!(first_run.contains(&5));
    assert!(first_run.contains(&6));
}
