//! End-to-end forwarding scenarios
//!
//! Each test builds a bridge from configuration and checks the complete
//! decision for one or more flows.

use super::*;
use bridgecore::config::{Config, PortConfig};
use bridgecore::dataplane::{BondMode, Destination, OdpAction, VLAN_NONE};
use std::collections::HashSet;
use std::time::{Duration, Instant};

fn ofports(decision: &Decision) -> Vec<OfPort> {
    decision.dsts.iter().map(|d| d.ofport).collect()
}

// ========================================
// Access port into trunk
// ========================================

#[test]
fn test_priority_tagged_access_frame_is_tagged_on_trunk() {
    let mut config = Config::default();
    config.ports.push(access("p1", 1, 5));
    config.ports.push(trunk("p2", 2, None));
    let mut h = Harness::new(&config, &[]);

    // VID 0 with priority 3
    let flow = FlowKey::l2(1, mac(1), mac(2), VlanTci::new(0, 3));
    let decision = h.forward(&flow);

    assert!(decision.dropped.is_none());
    assert_eq!(
        decision.dsts.as_slice(),
        &[Destination {
            vlan: 5,
            ofport: 2
        }]
    );
    assert_eq!(
        decision.actions,
        vec![OdpAction::SetVlan(VlanTci::new(5, 3)), OdpAction::Output(2)]
    );
}

#[test]
fn test_tagged_frame_on_access_port_is_dropped() {
    let mut config = Config::default();
    config.ports.push(access("p1", 1, 5));
    config.ports.push(trunk("p2", 2, None));
    let mut h = Harness::new(&config, &[]);

    let decision = h.forward(&tagged(1, mac(1), mac(2), 9));
    assert!(decision.dropped.is_some());
    assert!(decision.actions.is_empty());
    assert_eq!(h.bridge.metrics().drops("vlan"), 1);
}

// ========================================
// Active-backup failover
// ========================================

#[test]
fn test_active_backup_failover() {
    let mut config = Config::default();
    config.ports.push(trunk("p1", 1, None));
    let mut bond = PortConfig::new("bond0", vec![slave("a", 3), slave("b", 4)]);
    bond.bond_mode = BondMode::ActiveBackup;
    bond.updelay_ms = 1000;
    config.ports.push(bond);
    let mut h = Harness::new(&config, &["b"]);

    let flow = FlowKey::l2(1, mac(1), MacAddr::BROADCAST, VlanTci::NONE);
    for _ in 0..5 {
        assert_eq!(ofports(&h.forward(&flow)), vec![3]);
    }

    // b comes up but must wait out its updelay
    let t0 = Instant::now();
    h.carrier.set("b", true);
    h.bridge.tick_link_health(t0);
    let before = h.forward(&flow);
    assert_eq!(ofports(&before), vec![3]);

    h.revalidator.take();
    h.sender.take();
    h.carrier.set("a", false);
    h.bridge.tick_link_health(t0 + Duration::from_millis(100));

    let bond = h.bridge.port("bond0").unwrap();
    assert!(!bond.slaves()[0].is_enabled());
    assert!(bond.slaves()[1].is_enabled());
    assert_eq!(bond.active_slave().map(|s| s.name()), Some("b"));

    // The cached decision depended on the active slave
    let revalidated = h.revalidator.take();
    assert!(revalidated.iter().any(|t| before.tags.contains(*t)));

    // Upstream switches are told where mac(1) lives now
    let sent = h.sender.take();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].mac, mac(1));
    assert_eq!(sent[0].vlan, None);
    assert_eq!(sent[0].ofport, 4);

    assert_eq!(ofports(&h.forward(&flow)), vec![4]);
}

// ========================================
// Mirroring to a VLAN
// ========================================

#[test]
fn test_vlan_mirror_copies_unicast_flow() {
    let mut config = Config::default();
    config.ports.push(access("p3", 3, 7));
    config.ports.push(trunk("p4", 4, None));
    config.ports.push(trunk("p5", 5, Some(&[99])));
    config.ports.push(access("p6", 6, 99));
    config.ports.push(trunk("p7", 7, Some(&[7])));
    config.mirrors.push(vlan_mirror("m", "p3", 99));
    let mut h = Harness::new(&config, &[]);

    // Teach the bridge that mac(4) lives on p4
    h.forward(&tagged(4, mac(4), MacAddr::BROADCAST, 7));

    let flow = FlowKey::l2(3, mac(3), mac(4), VlanTci::NONE);
    let decision = h.forward(&flow);

    let got: HashSet<Destination> = decision.dsts.iter().copied().collect();
    let expected: HashSet<Destination> = [
        Destination { vlan: 7, ofport: 4 },
        Destination { vlan: 99, ofport: 4 },
        Destination { vlan: 99, ofport: 5 },
        Destination {
            vlan: VLAN_NONE,
            ofport: 6,
        },
    ]
    .into_iter()
    .collect();
    assert_eq!(got, expected);
    assert_eq!(decision.dsts.len(), 4);

    // Copies that keep the frame untagged come first
    assert_eq!(decision.dsts.as_slice()[0].vlan, VLAN_NONE);
    assert_eq!(decision.actions[0], OdpAction::Output(6));
}
