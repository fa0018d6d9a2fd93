//! Admissibility of flows into the bridge

use super::fdb::MacLearning;
use super::flow::{FlowKey, OfPort};
use super::hooks::Lacp;
use super::port::Port;
use super::tag::TagSet;
use super::vlan::{self, VlanError};
use tracing::warn;

/// Why a flow is not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Inadmissible {
    #[error("received on unknown interface {ofport}")]
    UnknownIngress { ofport: OfPort },
    #[error(transparent)]
    Vlan(#[from] VlanError),
    #[error("destination is a reserved multicast address")]
    ReservedDestination,
    #[error("received on port reserved for mirroring")]
    MirrorOutputPort,
    #[error("slave not enabled by LACP")]
    LacpDisabledSlave,
    #[error("multicast received on inactive bond slave")]
    InactiveSlaveMulticast,
    #[error("source learned on another port")]
    Reflected,
}

impl Inadmissible {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Inadmissible::UnknownIngress { .. } => "unknown_ingress",
            Inadmissible::Vlan(_) => "vlan",
            Inadmissible::ReservedDestination => "reserved_destination",
            Inadmissible::MirrorOutputPort => "mirror_output_port",
            Inadmissible::LacpDisabledSlave => "lacp_disabled_slave",
            Inadmissible::InactiveSlaveMulticast => "inactive_slave_multicast",
            Inadmissible::Reflected => "reflected",
        }
    }
}

/// An admitted flow's effective VLAN and where it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    pub vlan: u16,
    /// Index of the ingress port
    pub port: usize,
    /// Index of the ingress slave within that port
    pub slave: usize,
}

/// Finds the port and slave indices of datapath port `ofport`
pub fn find_slave(ports: &[Port], ofport: OfPort) -> Option<(usize, usize)> {
    ports
        .iter()
        .enumerate()
        .find_map(|(p, port)| port.slave_by_ofport(ofport).map(|s| (p, s)))
}

/// Decides whether `flow` may be forwarded.
///
/// `have_packet` is false when revalidating a cached decision; it only
/// silences diagnostics. May add tags to `tags` (multicast on bonds
/// depends on which slave is active).
pub fn check(
    bridge: &str,
    ports: &[Port],
    ml: &dyn MacLearning,
    lacp: &dyn Lacp,
    flow: &FlowKey,
    have_packet: bool,
    tags: &mut TagSet,
) -> Result<Admitted, Inadmissible> {
    let Some((port_idx, slave_idx)) = find_slave(ports, flow.in_port) else {
        if have_packet {
            warn!(bridge = %bridge, ofport = flow.in_port, "Received packet on unknown interface");
        }
        return Err(Inadmissible::UnknownIngress {
            ofport: flow.in_port,
        });
    };
    let port = &ports[port_idx];

    let vlan = vlan::resolve(flow, &port.vlan_mode).inspect_err(|e| {
        if have_packet {
            warn!(bridge = %bridge, port = %port.name, "Dropping packet: {}", e);
        }
    })?;

    if flow.dl_dst.is_reserved() {
        return Err(Inadmissible::ReservedDestination);
    }

    if port.is_mirror_output {
        if have_packet {
            warn!(
                bridge = %bridge,
                port = %port.name,
                "Dropping packet received on port reserved exclusively for mirroring"
            );
        }
        return Err(Inadmissible::MirrorOutputPort);
    }

    let negotiated = port.lacp_negotiated(lacp);
    if negotiated && !port.lacp_may_enable(slave_idx, lacp) {
        return Err(Inadmissible::LacpDisabledSlave);
    }

    // Without LACP the far end does not know the slaves form one link,
    // so it may hand our own floods back to us on another slave.
    if port.is_bond() && !negotiated {
        if flow.dl_dst.is_multicast() {
            tags.insert(port.active_tag);
            if port.active_slave != Some(slave_idx) {
                return Err(Inadmissible::InactiveSlaveMulticast);
            }
        }

        // A source learned elsewhere means we probably sent this packet
        // and got it back. Gratuitous ARPs mean the host moved, unless
        // the entry is locked against exactly such reflections.
        if let Some(learned) = ml.lookup(flow.dl_src, vlan) {
            if learned.port != port.id
                && (!flow.is_gratuitous_arp() || learned.grat_arp_locked)
            {
                return Err(Inadmissible::Reflected);
            }
        }
    }

    Ok(Admitted {
        vlan,
        port: port_idx,
        slave: slave_idx,
    })
}
