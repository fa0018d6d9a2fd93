//! Configuration validation

use super::{Config, VLAN_MAX};
use crate::dataplane::{BondMode, LacpMode, MAX_MIRRORS};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_bridge(config, &mut result);
    validate_ports(config, &mut result);
    validate_mirrors(config, &mut result);

    result
}

fn validate_bridge(config: &Config, result: &mut ValidationResult) {
    if config.bridge.name.is_empty() {
        result.error("bridge.name: must not be empty");
    }
    for vlan in &config.bridge.flood_vlans {
        if *vlan > VLAN_MAX {
            result.error(format!("bridge.flood_vlans: VLAN {} out of range", vlan));
        }
    }
}

fn validate_ports(config: &Config, result: &mut ValidationResult) {
    let mut port_names = HashSet::new();
    let mut slave_names = HashSet::new();
    let mut ofports = HashSet::new();

    for port in &config.ports {
        let name = &port.name;
        if !port_names.insert(name.as_str()) {
            result.error(format!("ports.{}: duplicate port name", name));
        }

        if port.slaves.is_empty() {
            result.error(format!("ports.{}: port has no slaves", name));
        }
        for slave in &port.slaves {
            if !slave_names.insert(slave.name.as_str()) {
                result.error(format!(
                    "ports.{}: slave '{}' appears more than once",
                    name, slave.name
                ));
            }
            if !ofports.insert(slave.ofport) {
                result.error(format!(
                    "ports.{}: ofport {} of slave '{}' is already in use",
                    name, slave.ofport, slave.name
                ));
            }
        }

        if let Some(tag) = port.tag {
            if tag > VLAN_MAX {
                result.error(format!("ports.{}: tag {} out of range", name, tag));
            }
            if port.trunks.is_some() {
                result.warn(format!(
                    "ports.{}: both tag and trunks specified, ignoring trunks",
                    name
                ));
            }
            if port.slaves.len() > 1 {
                result.warn(format!(
                    "ports.{}: tag ignored on bonded port, port carries all trunks",
                    name
                ));
            }
        }

        for vlan in port.trunks.iter().flatten() {
            if *vlan > VLAN_MAX {
                result.error(format!("ports.{}: trunk VLAN {} out of range", name, vlan));
            }
        }

        if port.bond_mode == BondMode::TransportHash && port.lacp == LacpMode::Off {
            result.warn(format!(
                "ports.{}: balance-tcp without LACP falls back to source hashing",
                name
            ));
        }
    }
}

fn validate_mirrors(config: &Config, result: &mut ValidationResult) {
    if config.mirrors.len() > MAX_MIRRORS {
        result.error(format!(
            "mirrors: {} mirrors configured, maximum is {}",
            config.mirrors.len(),
            MAX_MIRRORS
        ));
    }

    let port_exists = |name: &str| config.ports.iter().any(|p| p.name == name);
    let mut names = HashSet::new();

    for mirror in &config.mirrors {
        let name = &mirror.name;
        if !names.insert(name.as_str()) {
            result.error(format!("mirrors.{}: duplicate mirror name", name));
        }

        match (&mirror.output_port, mirror.output_vlan) {
            (None, None) => {
                result.error(format!("mirrors.{}: neither output_port nor output_vlan", name));
            }
            (Some(_), Some(_)) => {
                result.warn(format!(
                    "mirrors.{}: both output_port and output_vlan specified, ignoring output_vlan",
                    name
                ));
            }
            (None, Some(vlan)) if vlan > VLAN_MAX => {
                result.error(format!("mirrors.{}: output_vlan {} out of range", name, vlan));
            }
            _ => {}
        }

        if let Some(out) = &mirror.output_port {
            if !port_exists(out) {
                result.error(format!("mirrors.{}: output port '{}' not defined", name, out));
            }
        }

        for port in mirror.select_src_ports.iter().chain(&mirror.select_dst_ports) {
            if !port_exists(port) {
                result.error(format!("mirrors.{}: port '{}' not defined", name, port));
            }
        }

        for vlan in &mirror.select_vlans {
            if *vlan > VLAN_MAX {
                result.warn(format!("mirrors.{}: ignoring invalid VLAN {}", name, vlan));
            }
        }
    }
}
