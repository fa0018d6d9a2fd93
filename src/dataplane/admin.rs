//! Bond administration
//!
//! Read/write debug surface over the bonds of a bridge, used by
//! operational tooling.

use super::bond::bond_hash;
use super::bridge::Bridge;
use crate::{Error, Result};
use std::fmt::Write;
use std::time::Instant;
use tracing::info;

/// One row of `bond_list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondSummary {
    pub bridge: String,
    pub bond: String,
    pub slaves: Vec<String>,
}

impl Bridge {
    fn find_bond(&self, name: &str) -> Result<usize> {
        let idx = self.find_port(name)?;
        if !self.ports[idx].is_bond() {
            return Err(Error::NotABond {
                name: name.to_string(),
            });
        }
        Ok(idx)
    }

    fn find_bond_slave(&self, name: &str, slave: &str) -> Result<(usize, usize)> {
        let idx = self.find_bond(name)?;
        let s = self.ports[idx]
            .slave_index(slave)
            .ok_or_else(|| Error::SlaveNotFound {
                port: name.to_string(),
                slave: slave.to_string(),
            })?;
        Ok((idx, s))
    }

    /// Every bond on this bridge
    pub fn bond_list(&self) -> Vec<BondSummary> {
        self.ports
            .iter()
            .filter(|p| p.is_bond())
            .map(|p| BondSummary {
                bridge: self.name.clone(),
                bond: p.name.clone(),
                slaves: p.slaves.iter().map(|s| s.name.clone()).collect(),
            })
            .collect()
    }

    /// Human-readable state of bond `name` as of `now`
    pub fn bond_show(&self, name: &str, now: Instant) -> Result<String> {
        let port = &self.ports[self.find_bond(name)?];
        let entries = self.ml.entries();
        let mut out = String::new();

        let _ = writeln!(out, "mode: {}", port.settings.mode);
        let _ = writeln!(out, "updelay: {} ms", port.settings.updelay.as_millis());
        let _ = writeln!(out, "downdelay: {} ms", port.settings.downdelay.as_millis());
        if let Some(at) = port.next_rebalance {
            let _ = writeln!(
                out,
                "next rebalance: {} ms",
                at.saturating_duration_since(now).as_millis()
            );
        }

        for (i, slave) in port.slaves.iter().enumerate() {
            let state = if slave.enabled { "enabled" } else { "disabled" };
            let _ = writeln!(out, "slave {}: {}", slave.name, state);
            if port.active_slave == Some(i) {
                let _ = writeln!(out, "\tactive slave");
            }
            if let Some(at) = slave.delay_expires {
                let _ = writeln!(
                    out,
                    "\t{} expires in {} ms",
                    if slave.enabled { "downdelay" } else { "updelay" },
                    at.saturating_duration_since(now).as_millis()
                );
            }

            let Some(table) = port.bond_table.as_deref() else {
                continue;
            };
            for (hash, entry) in table.iter().enumerate() {
                if entry.slave != Some(i) {
                    continue;
                }
                let _ = writeln!(out, "\thash {}: {} kB load", hash, entry.tx_bytes / 1024);
                for learned in &entries {
                    if learned.port != port.id && bond_hash(learned.mac, learned.vlan) == hash {
                        let _ = writeln!(out, "\t\t{}", learned.mac);
                    }
                }
            }
        }

        Ok(out)
    }

    /// Moves hash bucket `bucket` of bond `name` onto `slave`
    pub fn bond_migrate(&mut self, name: &str, bucket: usize, slave: &str) -> Result<()> {
        let (idx, s) = self.find_bond_slave(name, slave)?;
        if self.ports[idx].bond_table.is_none() {
            return Err(Error::NotABond {
                name: name.to_string(),
            });
        }
        if !self.ports[idx].slaves[s].enabled {
            return Err(Error::SlaveDisabled {
                slave: slave.to_string(),
            });
        }

        self.with_port(idx, Instant::now(), |port, ctx| {
            port.migrate_bucket(bucket, s, ctx)
        });
        info!(bond = %name, bucket, slave = %slave, "Migrated bucket");
        Ok(())
    }

    /// Makes `slave` the active slave of bond `name`. Returns false if it
    /// already was.
    pub fn bond_set_active_slave(&mut self, name: &str, slave: &str) -> Result<bool> {
        let (idx, s) = self.find_bond_slave(name, slave)?;
        if !self.ports[idx].slaves[s].enabled {
            return Err(Error::SlaveDisabled {
                slave: slave.to_string(),
            });
        }
        Ok(self.with_port(idx, Instant::now(), |port, ctx| port.set_active_slave(s, ctx)))
    }

    pub fn bond_enable_slave(&mut self, name: &str, slave: &str) -> Result<()> {
        self.set_slave_enabled(name, slave, true)
    }

    pub fn bond_disable_slave(&mut self, name: &str, slave: &str) -> Result<()> {
        self.set_slave_enabled(name, slave, false)
    }

    fn set_slave_enabled(&mut self, name: &str, slave: &str, enable: bool) -> Result<()> {
        let (idx, s) = self.find_bond_slave(name, slave)?;
        self.with_port(idx, Instant::now(), |port, ctx| {
            port.enable_slave(s, enable, false, ctx)
        });
        Ok(())
    }
}
