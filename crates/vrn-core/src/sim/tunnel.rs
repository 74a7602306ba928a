// ── Tunnel endpoint selection ──

use super::verdict::TunnelEndpoint;
use crate::model::{EntityId, Port};
use crate::store::TopologySnapshot;

/// Pick the tunnel carrying traffic from `local_host` to `egress`, which
/// lives on `remote_host`. Among the zones both hosts belong to, the one
/// with the lowest id wins.
pub fn select_tunnel(
    snapshot: &TopologySnapshot,
    local_host: EntityId,
    remote_host: EntityId,
    egress: &Port,
) -> Option<TunnelEndpoint> {
    snapshot.tunnel_zones().find_map(|zone| {
        let local = zone.member(local_host)?;
        let remote = zone.member(remote_host)?;
        Some(TunnelEndpoint {
            zone_id: zone.id,
            kind: zone.kind,
            local_ip: local.ip,
            remote_ip: remote.ip,
            key: egress.tunnel_key,
        })
    })
}
