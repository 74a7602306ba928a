// ── Bridge step ──
//
// Learn the source, then pick the destination: a router port linked to
// one of our interior ports, else a learned entry, else flood to every
// other port.

use std::sync::Arc;

use tracing::{debug, trace};
use vrn_proto::{MacAddr, Packet};

use super::context::Learned;
use super::engine::{Branch, Walk};
use super::verdict::{DropReason, Transform};
use crate::model::{Bridge, EntityId, Port};
use crate::store::TopologySnapshot;

pub(super) fn process<'a>(
    walk: &mut Walk<'a>,
    bridge: &Bridge,
    ingress: &'a Arc<Port>,
    packet: Packet,
    transform: Transform,
) -> Branch {
    let now = walk.now;
    let src = packet.eth_src;
    if src.is_unicast() {
        if let Learned::Moved { from } = walk.ctx.mac_table_mut(bridge.id).learn(src, ingress.id, now) {
            debug!(bridge = %bridge.id, mac = %src, %from, to = %ingress.id, "MAC moved");
            walk.mac_moved = true;
        }
    }

    let snapshot = walk.snapshot;
    let ports = snapshot.device_ports(bridge.id);
    let dst = packet.eth_dst;

    let known = if dst.is_unicast() {
        router_port_link(snapshot, ports, dst).or_else(|| {
            let idle = walk.ctx.mac_idle();
            walk.ctx
                .mac_table(bridge.id)
                .and_then(|table| table.lookup(dst, now, idle))
                .filter(|learned| on_bridge(snapshot, bridge.id, *learned))
        })
    } else {
        None
    };

    match known {
        Some(port_id) if port_id == ingress.id => Branch::Drop(DropReason::Reflected),
        Some(port_id) => match snapshot.port(port_id) {
            Some(port) => walk.egress(port, packet, transform, Some(ingress.id)),
            None => Branch::Drop(DropReason::TopologyMissing),
        },
        None => flood(walk, ports, ingress, &packet, transform),
    }
}

/// A learned port may have moved to another device since it was learned.
fn on_bridge(snapshot: &TopologySnapshot, bridge_id: EntityId, port_id: EntityId) -> bool {
    let here = snapshot.port(port_id).is_some_and(|port| port.device_id == bridge_id);
    if !here {
        debug!(bridge = %bridge_id, port = %port_id, "learned port left the bridge, flooding");
    }
    here
}

/// Bridge port whose peer is a router port owning `mac`.
fn router_port_link(snapshot: &TopologySnapshot, ports: &[EntityId], mac: MacAddr) -> Option<EntityId> {
    ports.iter().copied().find(|id| {
        snapshot
            .port(*id)
            .and_then(|port| snapshot.peer(port))
            .and_then(|peer| peer.mac())
            == Some(mac)
    })
}

fn flood<'a>(
    walk: &mut Walk<'a>,
    ports: &'a [EntityId],
    ingress: &Port,
    packet: &Packet,
    transform: Transform,
) -> Branch {
    walk.cacheable = false;
    let snapshot = walk.snapshot;

    let mut out = Vec::new();
    let mut consumed = false;
    for port in ports
        .iter()
        .filter(|id| **id != ingress.id)
        .filter_map(|id| snapshot.port(*id))
    {
        match walk.egress(port, packet.clone(), transform, Some(ingress.id)) {
            Branch::Out(egress) => out.extend(egress),
            Branch::Consumed => consumed = true,
            Branch::Drop(reason) => trace!(port = %port.id, %reason, "flood branch dropped"),
            Branch::Suspended(s) => {
                trace!(port = %port.id, next_hop = %s.key.ip, "flood branch needs resolution, dropped");
            }
        }
    }

    match (out.is_empty(), consumed) {
        (false, _) => Branch::Out(out),
        (true, true) => Branch::Consumed,
        (true, false) => Branch::Drop(DropReason::NoEgress),
    }
}
