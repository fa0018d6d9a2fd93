//! External collaborators of the forwarding core
//!
//! The core never performs I/O itself. Carrier polling, LACP state,
//! cache invalidation and learning-packet transmission are reached
//! through the traits below and bundled in [`Hooks`].

use super::flow::OfPort;
use super::tag::Tag;
use crate::protocol::MacAddr;
use crate::Result;
use std::path::PathBuf;
use tracing::info;

/// Negotiated link aggregation (LACP) capability
pub trait Lacp {
    /// True if the protocol is running and negotiated on `port`
    fn is_negotiated(&self, port: &str) -> bool;
    /// True if the protocol allows `slave` of `port` to carry traffic
    fn may_enable(&self, port: &str, slave: &str) -> bool;
    fn notify_carrier_changed(&mut self, port: &str, slave: &str);
}

/// Control-plane invalidation sink
pub trait Revalidator {
    /// Every cached decision carrying `tag` must be recomputed
    fn revalidate(&mut self, tag: Tag);
    /// Every cached decision must be recomputed
    fn revalidate_all(&mut self);
}

/// Raw link state source
pub trait CarrierSource {
    fn get_carrier(&self, slave: &str) -> bool;
    fn get_miimon(&self, slave: &str) -> bool;
}

/// Synthetic frame re-announcing where a MAC lives after a failover
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub mac: MacAddr,
    /// VLAN to tag the frame with, `None` for untagged
    pub vlan: Option<u16>,
    pub ofport: OfPort,
}

/// Transmits learning packets
pub trait LearningPacketSender {
    fn send(&mut self, announcement: &Announcement) -> Result<()>;
}

/// All collaborators of one bridge
pub struct Hooks {
    pub lacp: Box<dyn Lacp>,
    pub revalidator: Box<dyn Revalidator>,
    pub carrier: Box<dyn CarrierSource>,
    pub sender: Box<dyn LearningPacketSender>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            lacp: Box::new(NoLacp),
            revalidator: Box::new(NullRevalidator),
            carrier: Box::new(AlwaysUp),
            sender: Box::new(NullSender),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}

// ========================================
// Production implementations
// ========================================

/// LACP is not running anywhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLacp;

impl Lacp for NoLacp {
    fn is_negotiated(&self, _port: &str) -> bool {
        false
    }

    fn may_enable(&self, _port: &str, _slave: &str) -> bool {
        true
    }

    fn notify_carrier_changed(&mut self, _port: &str, _slave: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullRevalidator;

impl Revalidator for NullRevalidator {
    fn revalidate(&mut self, _tag: Tag) {}
    fn revalidate_all(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysUp;

impl CarrierSource for AlwaysUp {
    fn get_carrier(&self, _slave: &str) -> bool {
        true
    }

    fn get_miimon(&self, _slave: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSender;

impl LearningPacketSender for NullSender {
    fn send(&mut self, _announcement: &Announcement) -> Result<()> {
        Ok(())
    }
}

/// Reads link state from `/sys/class/net/<slave>/`
///
/// Interfaces that cannot be read are reported down.
#[derive(Debug, Clone)]
pub struct SysfsCarrier {
    root: PathBuf,
}

impl SysfsCarrier {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, slave: &str, attr: &str) -> Option<String> {
        std::fs::read_to_string(self.root.join(slave).join(attr))
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl Default for SysfsCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CarrierSource for SysfsCarrier {
    fn get_carrier(&self, slave: &str) -> bool {
        self.read(slave, "carrier").is_some_and(|v| v == "1")
    }

    fn get_miimon(&self, slave: &str) -> bool {
        self.read(slave, "operstate").is_some_and(|v| v == "up")
    }
}

/// Logs announcements instead of transmitting them
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSender;

impl LearningPacketSender for LoggingSender {
    fn send(&mut self, a: &Announcement) -> Result<()> {
        info!(mac = %a.mac, vlan = ?a.vlan, ofport = a.ofport, "Learning packet");
        Ok(())
    }
}
