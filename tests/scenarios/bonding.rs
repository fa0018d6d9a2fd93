//! Load balancing and link debounce over time

use super::*;
use bridgecore::config::{Config, PortConfig};
use bridgecore::dataplane::{bond_hash, BondMode, LinkState, VLAN_NONE};
use std::collections::HashSet;
use std::time::{Duration, Instant};

// ========================================
// Rebalancer
// ========================================

fn slave_loads(h: &Harness) -> [u64; 2] {
    let mut loads = [0u64; 2];
    let bond = h.bridge.port("bond0").unwrap();
    for entry in bond.bond_table().unwrap() {
        if let Some(slave) = entry.slave {
            loads[slave] += entry.tx_bytes;
        }
    }
    loads
}

#[test]
fn test_rebalancer_converges() {
    let mut config = Config::default();
    config.ports.push(trunk("p1", 1, None));
    config.ports.push(PortConfig::new(
        "bond0",
        vec![slave("eth3", 3), slave("eth4", 4)],
    ));
    let mut h = Harness::new(&config, &[]);

    // Eight sources hashing to distinct buckets
    let mut buckets = HashSet::new();
    let sources: Vec<MacAddr> = (1..=u8::MAX)
        .map(mac)
        .filter(|m| buckets.insert(bond_hash(*m, VLAN_NONE)))
        .take(8)
        .collect();
    assert_eq!(sources.len(), 8);

    for src in &sources {
        let flow = FlowKey::l2(1, *src, MacAddr::BROADCAST, VlanTci::NONE);
        let decision = h.forward(&flow);
        h.bridge
            .account_flow(&flow, &decision.tags, &decision.actions, 125_000);
    }

    // Every bucket went to the first enabled slave
    let before = slave_loads(&h);
    assert_eq!(before, [1_000_000, 0]);

    let mut now = Instant::now() + Duration::from_secs(60);
    h.bridge.tick_load_balance(now);

    let after = slave_loads(&h);
    assert!(after[0].abs_diff(after[1]) < before[0].abs_diff(before[1]));
    assert!(after[1] > 0);
    assert!(h.bridge.metrics().bucket_migrations.get() > 0);

    // Without traffic the counters decay to nothing and release buckets
    let mut total = after[0] + after[1];
    for _ in 0..24 {
        now += Duration::from_secs(11);
        h.bridge.tick_load_balance(now);
        let loads = slave_loads(&h);
        let next = loads[0] + loads[1];
        assert!(next <= total);
        total = next;
    }
    assert_eq!(total, 0);
    let bond = h.bridge.port("bond0").unwrap();
    assert!(bond.bond_table().unwrap().iter().all(|e| e.slave.is_none()));
}

#[test]
fn test_rebalance_waits_for_interval() {
    let mut config = Config::default();
    config.ports.push(trunk("p1", 1, None));
    let mut bond = PortConfig::new("bond0", vec![slave("eth3", 3), slave("eth4", 4)]);
    bond.rebalance_interval_ms = 60_000;
    config.ports.push(bond);
    let mut h = Harness::new(&config, &[]);

    let flow = FlowKey::l2(1, mac(1), MacAddr::BROADCAST, VlanTci::NONE);
    let decision = h.forward(&flow);
    h.bridge
        .account_flow(&flow, &decision.tags, &decision.actions, 1_000);

    h.bridge.tick_load_balance(Instant::now());
    assert_eq!(slave_loads(&h), [1_000, 0]);
}

// ========================================
// Debounce
// ========================================

fn debounce_bridge() -> Harness {
    let mut config = Config::default();
    let mut bond = PortConfig::new("bond0", vec![slave("a", 3), slave("b", 4)]);
    bond.bond_mode = BondMode::ActiveBackup;
    bond.updelay_ms = 500;
    bond.downdelay_ms = 500;
    config.ports.push(bond);
    Harness::new(&config, &[])
}

fn slave_a(h: &Harness) -> (bool, LinkState) {
    let slave = &h.bridge.port("bond0").unwrap().slaves()[0];
    (slave.is_enabled(), slave.link_state())
}

#[test]
fn test_flapping_link_never_transitions() {
    let mut h = debounce_bridge();
    let t0 = Instant::now();

    // Down for 200 ms, up for 200 ms, repeatedly
    for i in 0..30u64 {
        h.carrier.set("a", (i / 2) % 2 == 1);
        h.bridge.tick_link_health(t0 + Duration::from_millis(i * 100));
        assert!(slave_a(&h).0);
    }

    let metrics = h.bridge.metrics();
    assert_eq!(metrics.slave_disables.get(), 0);
    assert_eq!(metrics.slave_enables.get(), 0);
    let bond = h.bridge.port("bond0").unwrap();
    assert_eq!(bond.active_slave().map(|s| s.name()), Some("a"));
}

#[test]
fn test_stable_link_transitions_once() {
    let mut h = debounce_bridge();
    let t0 = Instant::now();
    let at = |ms: u64| t0 + Duration::from_millis(ms);

    h.carrier.set("a", false);
    h.bridge.tick_link_health(at(0));
    assert_eq!(slave_a(&h), (true, LinkState::PendingDown(at(500))));

    for ms in [100, 200, 300, 400] {
        h.bridge.tick_link_health(at(ms));
        assert!(slave_a(&h).0);
    }
    h.bridge.tick_link_health(at(500));
    assert_eq!(slave_a(&h), (false, LinkState::Down));
    for ms in [600, 700, 1000] {
        h.bridge.tick_link_health(at(ms));
    }
    assert_eq!(h.bridge.metrics().slave_disables.get(), 1);
    let bond = h.bridge.port("bond0").unwrap();
    assert_eq!(bond.active_slave().map(|s| s.name()), Some("b"));

    // Coming back waits out the updelay, then enables exactly once
    h.carrier.set("a", true);
    h.bridge.tick_link_health(at(1100));
    assert_eq!(slave_a(&h), (false, LinkState::PendingUp(at(1600))));
    h.bridge.tick_link_health(at(1500));
    assert!(!slave_a(&h).0);
    h.bridge.tick_link_health(at(1600));
    assert_eq!(slave_a(&h), (true, LinkState::Up));
    h.bridge.tick_link_health(at(2000));
    assert_eq!(h.bridge.metrics().slave_enables.get(), 1);

    // b stays active: re-enabling a backup does not preempt
    let bond = h.bridge.port("bond0").unwrap();
    assert_eq!(bond.active_slave().map(|s| s.name()), Some("b"));
}
