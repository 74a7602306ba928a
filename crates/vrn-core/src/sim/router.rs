// ── Router step ──
//
// ARP addressed to a router port is answered or learned here. IPv4 is
// routed by longest-prefix match over static routes plus whatever the
// router's port services contribute, then MACs are rewritten for the
// next hop. An unknown next-hop MAC suspends the packet behind an ARP
// request.

use std::cmp::Reverse;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::trace;
use vrn_proto::{ArpOp, ArpPacket, EthPayload, MacAddr, Packet};

use super::engine::{Branch, Walk};
use super::verdict::{DropReason, Emission, ResolutionKey, Suspension, Transform};
use crate::model::{NextHop, Port, Route, Router, RouterPortAddress};

pub(super) fn process<'a>(
    walk: &mut Walk<'a>,
    router: &Router,
    ingress: &'a Arc<Port>,
    mut packet: Packet,
    mut transform: Transform,
) -> Branch {
    let Some(port_addr) = ingress.l3 else {
        return Branch::Drop(DropReason::TopologyMissing);
    };

    let (src, dst, ttl) = match &packet.payload {
        EthPayload::Arp(arp) => return handle_arp(walk, router, ingress, port_addr, *arp),
        EthPayload::Ipv4(ip) => (ip.src, ip.dst, ip.ttl),
        EthPayload::Other { .. } => return Branch::Drop(DropReason::UnsupportedEthertype),
    };
    if packet.eth_dst != port_addr.mac || owns_address(walk, router, dst) {
        return Branch::Drop(DropReason::NotForwarded);
    }

    let Some(route) = lookup(walk, router, src, dst) else {
        trace!(router = %router.id, %dst, "no route");
        return Branch::Drop(DropReason::NoRoute);
    };
    let (port_id, gateway) = match route.next_hop {
        NextHop::Port { port_id, gateway } => (port_id, gateway),
        NextHop::Blackhole => return Branch::Drop(DropReason::Blackhole),
        NextHop::Reject => return Branch::Drop(DropReason::Rejected),
    };

    let snapshot = walk.snapshot;
    let Some(egress) = snapshot.port(port_id).filter(|p| p.device_id == router.id) else {
        return Branch::Drop(DropReason::TopologyMissing);
    };
    let Some(egress_addr) = egress.l3 else {
        return Branch::Drop(DropReason::TopologyMissing);
    };

    if ttl <= 1 {
        return Branch::Drop(DropReason::TtlExpired);
    }
    if let Some(ip) = packet.ipv4_mut() {
        ip.ttl = ttl - 1;
    }
    transform.ttl_decrements = transform.ttl_decrements.saturating_add(1);

    let next_hop = gateway.unwrap_or(dst);
    let Some(next_hop_mac) = resolve(walk, router, egress, next_hop) else {
        trace!(router = %router.id, %next_hop, "next hop unresolved, suspending");
        return Branch::Suspended(Suspension {
            key: ResolutionKey {
                router_id: router.id,
                port_id: egress.id,
                ip: next_hop,
            },
            request: Emission {
                from_port: egress.id,
                packet: Packet::arp_request(egress_addr.mac, egress_addr.ip(), next_hop),
            },
        });
    };

    packet.eth_src = egress_addr.mac;
    packet.eth_dst = next_hop_mac;
    transform.eth_src = Some(egress_addr.mac);
    transform.eth_dst = Some(next_hop_mac);
    walk.egress(egress, packet, transform, Some(ingress.id))
}

fn handle_arp(
    walk: &mut Walk<'_>,
    router: &Router,
    ingress: &Port,
    port_addr: RouterPortAddress,
    arp: ArpPacket,
) -> Branch {
    walk.cacheable = false;
    if arp.target_ip != port_addr.ip() {
        return Branch::Drop(DropReason::NotForwarded);
    }
    match arp.op {
        ArpOp::Request => {
            walk.emissions.push(Emission {
                from_port: ingress.id,
                packet: Packet::arp_reply(&arp, port_addr.mac),
            });
            learn(walk, router, ingress, &arp);
            Branch::Consumed
        }
        ArpOp::Reply => {
            learn(walk, router, ingress, &arp);
            Branch::Consumed
        }
        ArpOp::Other(_) => Branch::Drop(DropReason::NotForwarded),
    }
}

fn learn(walk: &mut Walk<'_>, router: &Router, ingress: &Port, arp: &ArpPacket) {
    if arp.sender_mac == MacAddr::ZERO || arp.sender_mac.is_multicast() {
        return;
    }
    walk.ctx
        .arp_learn(router.id, arp.sender_ip, arp.sender_mac, walk.now);
    walk.resolved.push(ResolutionKey {
        router_id: router.id,
        port_id: ingress.id,
        ip: arp.sender_ip,
    });
}

fn owns_address(walk: &Walk<'_>, router: &Router, addr: Ipv4Addr) -> bool {
    walk.snapshot
        .device_ports(router.id)
        .iter()
        .filter_map(|id| walk.snapshot.port(*id))
        .any(|port| port.l3.is_some_and(|l3| l3.ip() == addr))
}

/// Longest prefix wins, then lowest weight, then static routes before
/// service routes and service routes in port order.
pub(super) fn lookup(walk: &mut Walk<'_>, router: &Router, src: Ipv4Addr, dst: Ipv4Addr) -> Option<Route> {
    let snapshot = walk.snapshot;
    let mut routes = router.routes.clone();
    for port_id in snapshot.device_ports(router.id) {
        routes.extend(walk.service(*port_id).routes());
    }
    routes
        .into_iter()
        .filter(|route| route.matches(src, dst))
        .min_by_key(|route| (Reverse(route.dst.prefix_len()), route.weight))
}

/// Next-hop MAC from topology (a linked router port owning the address)
/// or from the ARP cache.
fn resolve(walk: &Walk<'_>, router: &Router, egress: &Port, next_hop: Ipv4Addr) -> Option<MacAddr> {
    let linked = walk
        .snapshot
        .peer(egress)
        .and_then(|peer| peer.l3)
        .filter(|l3| l3.ip() == next_hop)
        .map(|l3| l3.mac);
    linked.or_else(|| walk.ctx.arp_lookup(router.id, next_hop, walk.now))
}
