// ── Simulation output ──

use std::net::Ipv4Addr;

use vrn_proto::{MacAddr, Packet, TunnelKind};

use crate::model::EntityId;

/// Why a packet was dropped. Kept as data so it can be logged and
/// counted; none of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum DropReason {
    /// The frame could not be parsed.
    Malformed,
    /// The datapath port is not bound to a virtual port.
    UnmappedPort,
    /// A referenced topology object is not in the snapshot.
    TopologyMissing,
    /// A chain rule dropped the packet.
    Filtered,
    /// A chain rule rejected the packet.
    Rejected,
    NoRoute,
    Blackhole,
    TtlExpired,
    /// The egress port lives on a host no shared tunnel zone reaches.
    NoRouteToPeerHost,
    /// The egress port is bound to nothing.
    PortUnbound,
    /// Device or chain-jump budget exhausted.
    LoopDetected,
    /// IPv4 sent to a router port with someone else's MAC, or to the
    /// router's own address.
    NotForwarded,
    /// The router only handles IPv4 and ARP.
    UnsupportedEthertype,
    /// The learned destination is the ingress port itself.
    Reflected,
    /// Next-hop resolution did not finish in time.
    ResolutionTimeout,
    /// Too many packets already waiting on the same next hop.
    ResolutionQueueFull,
    /// Every candidate egress was filtered or unreachable.
    NoEgress,
}

/// Header rewrites accumulated along the path to one egress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Transform {
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub nw_src: Option<Ipv4Addr>,
    pub nw_dst: Option<Ipv4Addr>,
    /// Router hops traversed; each decrements TTL once.
    pub ttl_decrements: u8,
}

impl Transform {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }
}

/// Encapsulation toward the host owning the egress port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelEndpoint {
    pub zone_id: EntityId,
    pub kind: TunnelKind,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub key: u32,
}

/// One concrete output of an accepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Egress {
    /// Exterior virtual port the packet leaves through.
    pub port_id: EntityId,
    pub transform: Transform,
    /// Set when the port is on another host.
    pub tunnel: Option<TunnelEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowVerdict {
    Drop(DropReason),
    Accept(Vec<Egress>),
    /// Absorbed by a virtual device (ARP handled by a router).
    Consumed,
}

/// A packet a virtual device generated, to be sent as if it left
/// `from_port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub from_port: EntityId,
    pub packet: Packet,
}

/// Identifies one outstanding next-hop resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolutionKey {
    pub router_id: EntityId,
    pub port_id: EntityId,
    pub ip: Ipv4Addr,
}

/// The packet must wait for `key` to resolve; `request` asks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspension {
    pub key: ResolutionKey,
    pub request: Emission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOutcome {
    Done(FlowVerdict),
    Suspended(Suspension),
}

/// Everything one simulation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Simulation {
    pub outcome: SimOutcome,
    /// The verdict depends only on the packet's headers and topology, so
    /// it may be installed as a flow.
    pub cacheable: bool,
    /// Packets generated by virtual devices along the way.
    pub emissions: Vec<Emission>,
    /// Resolutions completed by this packet (learned ARP replies).
    pub resolved: Vec<ResolutionKey>,
    /// A source MAC moved between ports; installed flows may be stale.
    pub mac_moved: bool,
}

impl Simulation {
    pub(crate) fn done(verdict: FlowVerdict) -> Self {
        Self {
            outcome: SimOutcome::Done(verdict),
            cacheable: false,
            emissions: Vec::new(),
            resolved: Vec::new(),
            mac_moved: false,
        }
    }

    /// The final verdict, or `None` while suspended.
    pub fn verdict(&self) -> Option<&FlowVerdict> {
        match &self.outcome {
            SimOutcome::Done(verdict) => Some(verdict),
            SimOutcome::Suspended(_) => None,
        }
    }
}
