// ── Tunnel zones ──
//
// A zone groups hosts that reach each other with one encapsulation.
// Memberships live as child nodes of the zone keyed by host id, so a
// host appears at most once per zone.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use vrn_proto::TunnelKind;

use super::EntityId;

/// A host's address inside one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelZone {
    pub id: EntityId,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    /// Filled from the zone's member nodes, never stored in the zone node.
    #[serde(default, skip_serializing)]
    pub members: BTreeMap<EntityId, HostConfig>,
}

impl TunnelZone {
    pub fn member(&self, host_id: EntityId) -> Option<&HostConfig> {
        self.members.get(&host_id)
    }
}
