// ── Virtual ports ──

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use vrn_proto::MacAddr;

use super::EntityId;

/// What a port is plugged into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortBinding {
    #[default]
    Unbound,
    /// Bound to an interface on a physical host.
    Exterior { host_id: EntityId, interface: String },
    /// Linked to another virtual port.
    Interior { peer_id: EntityId },
}

/// L3 configuration carried by router ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterPortAddress {
    pub mac: MacAddr,
    /// Port address plus the prefix of the attached network.
    pub address: Ipv4Net,
}

impl RouterPortAddress {
    pub fn ip(&self) -> Ipv4Addr {
        self.address.addr()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: EntityId,
    /// Owning bridge or router.
    pub device_id: EntityId,
    #[serde(default)]
    pub l3: Option<RouterPortAddress>,
    #[serde(default)]
    pub binding: PortBinding,
    #[serde(default)]
    pub inbound_filter: Option<EntityId>,
    #[serde(default)]
    pub outbound_filter: Option<EntityId>,
    /// Key carried on tunnels that deliver to this port.
    #[serde(default)]
    pub tunnel_key: u32,
}

impl Port {
    pub fn peer_id(&self) -> Option<EntityId> {
        match self.binding {
            PortBinding::Interior { peer_id } => Some(peer_id),
            PortBinding::Unbound | PortBinding::Exterior { .. } => None,
        }
    }

    pub fn host_id(&self) -> Option<EntityId> {
        match self.binding {
            PortBinding::Exterior { host_id, .. } => Some(host_id),
            PortBinding::Unbound | PortBinding::Interior { .. } => None,
        }
    }

    pub fn mac(&self) -> Option<MacAddr> {
        self.l3.map(|l3| l3.mac)
    }
}
