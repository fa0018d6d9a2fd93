//! Configuration types

use crate::dataplane::{BondMode, BondSettings, LacpMode, LinkDetect, OfPort, PortVlanConfig, VlanBitmap};
use crate::telemetry::LogConfig;
use serde::Deserialize;
use std::time::Duration;

/// Highest valid 802.1Q VLAN ID
pub const VLAN_MAX: u16 = 4095;

/// Bridge configuration (bridge.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_name")]
    pub name: String,
    #[serde(default = "default_mac_aging_secs")]
    pub mac_aging_secs: u64,
    /// VLANs on which MAC learning is disabled
    #[serde(default)]
    pub flood_vlans: Vec<u16>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            mac_aging_secs: default_mac_aging_secs(),
            flood_vlans: Vec::new(),
        }
    }
}

fn default_bridge_name() -> String {
    "br0".to_string()
}

fn default_mac_aging_secs() -> u64 {
    crate::dataplane::DEFAULT_AGING_TIME_SECS
}

fn default_rebalance_interval_ms() -> u64 {
    crate::dataplane::DEFAULT_REBALANCE_INTERVAL.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SlaveConfig {
    pub name: String,
    pub ofport: OfPort,
    /// Exclude this slave (and so its port) from floods
    #[serde(default)]
    pub no_flood: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortConfig {
    pub name: String,
    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,
    /// Access VLAN
    pub tag: Option<u16>,
    /// Trunked VLANs; absent means all
    pub trunks: Option<Vec<u16>>,
    #[serde(default)]
    pub bond_mode: BondMode,
    #[serde(default)]
    pub updelay_ms: u64,
    #[serde(default)]
    pub downdelay_ms: u64,
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
    #[serde(default)]
    pub detect: LinkDetect,
    #[serde(default)]
    pub lacp: LacpMode,
}

impl PortConfig {
    /// Port with the given slaves and every other setting at its default
    pub fn new(name: impl Into<String>, slaves: Vec<SlaveConfig>) -> Self {
        Self {
            name: name.into(),
            slaves,
            tag: None,
            trunks: None,
            bond_mode: BondMode::default(),
            updelay_ms: 0,
            downdelay_ms: 0,
            rebalance_interval_ms: default_rebalance_interval_ms(),
            detect: LinkDetect::default(),
            lacp: LacpMode::default(),
        }
    }

    /// VLAN settings with out-of-range VLANs dropped. An access tag
    /// overrides the trunk list.
    pub fn vlan_config(&self) -> PortVlanConfig {
        let tag = self.tag.filter(|t| *t <= VLAN_MAX);
        let trunks = match (&self.trunks, tag) {
            (Some(list), None) => Some(VlanBitmap::from_vlans(
                list.iter().copied().filter(|v| *v <= VLAN_MAX),
            )),
            _ => None,
        };
        PortVlanConfig { tag, trunks }
    }

    pub fn bond_settings(&self) -> BondSettings {
        BondSettings {
            mode: self.bond_mode,
            updelay: Duration::from_millis(self.updelay_ms),
            downdelay: Duration::from_millis(self.downdelay_ms),
            rebalance_interval: Duration::from_millis(self.rebalance_interval_ms),
            detect: self.detect,
            lacp: self.lacp,
        }
        .normalized()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub name: String,
    /// Mirror every port in both directions
    pub select_all: bool,
    /// Ports whose received traffic is mirrored
    pub select_src_ports: Vec<String>,
    /// Ports whose transmitted traffic is mirrored
    pub select_dst_ports: Vec<String>,
    /// Only mirror traffic in these VLANs
    pub select_vlans: Vec<u16>,
    pub output_port: Option<String>,
    pub output_vlan: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[bridge]
name = "br-int"
flood_vlans = [99]

[[ports]]
name = "uplink"
slaves = [{ name = "eth0", ofport = 1 }, { name = "eth1", ofport = 2 }]
bond_mode = "active-backup"
updelay_ms = 200
rebalance_interval_ms = 10

[[ports]]
name = "vm1"
slaves = [{ name = "tap0", ofport = 3, no_flood = true }]
tag = 10

[[mirrors]]
name = "span"
select_src_ports = ["vm1"]
output_vlan = 99

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.bridge.name, "br-int");
        assert_eq!(config.bridge.mac_aging_secs, 300);
        assert_eq!(config.bridge.flood_vlans, vec![99]);
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].bond_mode, BondMode::ActiveBackup);
        assert_eq!(config.ports[0].slaves[1].ofport, 2);
        assert!(config.ports[1].slaves[0].no_flood);
        assert_eq!(config.mirrors[0].output_vlan, Some(99));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, crate::telemetry::LogFormat::Pretty);
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.bridge.name, "br0");
        assert!(config.ports.is_empty());
        assert!(config.mirrors.is_empty());
    }

    #[test]
    fn test_bond_settings_conversion() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let settings = config.ports[0].bond_settings();
        assert_eq!(settings.updelay, Duration::from_millis(200));
        assert_eq!(settings.downdelay, Duration::ZERO);
        // Clamped to the minimum interval
        assert_eq!(settings.rebalance_interval, Duration::from_secs(1));
        assert_eq!(settings.lacp, LacpMode::Off);
    }

    #[test]
    fn test_vlan_config_conversion() {
        let mut port = PortConfig::new("p", vec![]);
        port.trunks = Some(vec![10, 5000, 20]);
        let vlan = port.vlan_config();
        assert_eq!(vlan.tag, None);
        assert_eq!(vlan.trunks, Some(VlanBitmap::from_vlans([10, 20])));

        port.tag = Some(7);
        let vlan = port.vlan_config();
        assert_eq!(vlan.tag, Some(7));
        assert_eq!(vlan.trunks, None);
    }

    #[test]
    fn test_unknown_bond_mode_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[[ports]]
name = "p"
bond_mode = "round-robin"
"#,
        );
        assert!(result.is_err());
    }
}
