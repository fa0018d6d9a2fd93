//! Forwarding scenarios driven through the public bridge API
//!
//! Run with: cargo test --test scenarios

mod bonding;
mod doubles;
mod end_to_end;
mod properties;

use bridgecore::config::{Config, MirrorConfig, PortConfig, SlaveConfig};
use bridgecore::dataplane::{Bridge, Decision, FlowKey, Hooks, OfPort};
use bridgecore::protocol::{MacAddr, VlanTci};
use bridgecore::telemetry::MetricsRegistry;
use doubles::{RecordingRevalidator, RecordingSender, ScriptedCarrier};
use std::sync::Arc;

/// A bridge plus handles on its test doubles
pub struct Harness {
    pub bridge: Bridge,
    pub revalidator: RecordingRevalidator,
    pub sender: RecordingSender,
    pub carrier: ScriptedCarrier,
}

impl Harness {
    /// Builds a bridge from `config`. Links listed in `down` start without
    /// carrier.
    pub fn new(config: &Config, down: &[&str]) -> Self {
        let revalidator = RecordingRevalidator::default();
        let sender = RecordingSender::default();
        let carrier = ScriptedCarrier::default();
        for slave in down {
            carrier.set(slave, false);
        }
        let hooks = Hooks {
            revalidator: Box::new(revalidator.clone()),
            sender: Box::new(sender.clone()),
            carrier: Box::new(carrier.clone()),
            ..Default::default()
        };
        let bridge = Bridge::from_config(config, hooks, Arc::new(MetricsRegistry::new()))
            .expect("valid scenario config");
        Self {
            bridge,
            revalidator,
            sender,
            carrier,
        }
    }

    pub fn forward(&mut self, flow: &FlowKey) -> Decision {
        self.bridge
            .process_flow(flow, true)
            .expect("live packets are never ejected")
    }
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr([0x02, 0, 0, 0, 0, last])
}

pub fn slave(name: &str, ofport: OfPort) -> SlaveConfig {
    SlaveConfig {
        name: name.to_string(),
        ofport,
        no_flood: false,
    }
}

pub fn access(name: &str, ofport: OfPort, vlan: u16) -> PortConfig {
    let mut port = PortConfig::new(name, vec![slave(&format!("{}-eth", name), ofport)]);
    port.tag = Some(vlan);
    port
}

pub fn trunk(name: &str, ofport: OfPort, vlans: Option<&[u16]>) -> PortConfig {
    let mut port = PortConfig::new(name, vec![slave(&format!("{}-eth", name), ofport)]);
    port.trunks = vlans.map(|v| v.to_vec());
    port
}

pub fn vlan_mirror(name: &str, port: &str, out_vlan: u16) -> MirrorConfig {
    MirrorConfig {
        name: name.to_string(),
        select_src_ports: vec![port.to_string()],
        select_dst_ports: vec![port.to_string()],
        output_vlan: Some(out_vlan),
        ..Default::default()
    }
}

pub fn tagged(in_port: OfPort, src: MacAddr, dst: MacAddr, vlan: u16) -> FlowKey {
    FlowKey::l2(in_port, src, dst, VlanTci::new(vlan, 0))
}
