// ── Switch controller ──
//
// One per accepted switch connection. Owns the connection's soft state
// (MAC tables, ARP cache, packets held on next-hop resolution) and the
// datapath-port ↔ virtual-port map learned from port-status messages.
// Every packet-in is simulated against the snapshot pinned at arrival
// and answered with a flow install, a packet-out, or nothing.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use vrn_proto::packet;
use vrn_proto::{
    ControllerMessage, FlowAction, FlowMatch, Ipv4Packet, MacAddr, Packet, ProtoError,
    SwitchMessage,
};

use crate::config::{MAX_TIMER, SwitchSettings};
use crate::model::{EntityId, EntityKind};
use crate::sim::{
    DropReason, Egress, Emission, FlowVerdict, HoldResult, PendingResolutions, SimContext,
    SimOutcome, SimulationEngine, Suspension,
};
use crate::store::{TopologyCache, TopologyChange, TopologySnapshot};

/// Simulations one switch message may trigger, generated packets and
/// released held packets included.
const MAX_WORK_PER_MESSAGE: usize = 64;

/// Housekeeping never runs more often than this.
const MIN_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);

/// A received packet, kept whole so it can be re-simulated after its
/// next hop resolves.
#[derive(Debug, Clone)]
struct HeldPacket {
    ingress: EntityId,
    in_port: u32,
    buffer_id: Option<u32>,
    packet: Packet,
    frame: Bytes,
}

enum Work {
    Received(HeldPacket),
    Generated(Emission),
}

// ── Port map ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PortMap {
    by_no: HashMap<u32, EntityId>,
    by_vport: HashMap<EntityId, u32>,
}

impl PortMap {
    /// Returns true when the mapping changed.
    fn bind(&mut self, port_no: u32, vport: EntityId) -> bool {
        if self.by_no.get(&port_no) == Some(&vport) {
            return false;
        }
        self.unbind(port_no);
        if let Some(old_no) = self.by_vport.insert(vport, port_no) {
            self.by_no.remove(&old_no);
        }
        self.by_no.insert(port_no, vport);
        true
    }

    fn unbind(&mut self, port_no: u32) -> Option<EntityId> {
        let vport = self.by_no.remove(&port_no)?;
        self.by_vport.remove(&vport);
        Some(vport)
    }

    fn vport(&self, port_no: u32) -> Option<EntityId> {
        self.by_no.get(&port_no).copied()
    }

    fn port_no(&self, vport: EntityId) -> Option<u32> {
        self.by_vport.get(&vport).copied()
    }

    fn clear(&mut self) {
        self.by_no.clear();
        self.by_vport.clear();
    }
}

// ── Controller ──────────────────────────────────────────────────────

pub struct SwitchController {
    cache: Arc<TopologyCache>,
    engine: Arc<SimulationEngine>,
    settings: SwitchSettings,
    external_id_key: String,
    ctx: SimContext,
    ports: PortMap,
    pending: PendingResolutions<HeldPacket>,
    datapath_id: Option<u64>,
    changes: broadcast::Receiver<TopologyChange>,
}

impl std::fmt::Debug for SwitchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchController")
            .field("datapath_id", &self.datapath_id)
            .field("mapped_ports", &self.ports.by_no.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl SwitchController {
    pub fn new(
        cache: Arc<TopologyCache>,
        engine: Arc<SimulationEngine>,
        settings: SwitchSettings,
        external_id_key: impl Into<String>,
    ) -> Self {
        let changes = cache.subscribe();
        let ctx = SimContext::new(settings.mac_idle_timeout, settings.arp_entry_ttl);
        Self {
            cache,
            engine,
            settings,
            external_id_key: external_id_key.into(),
            ctx,
            ports: PortMap::default(),
            pending: PendingResolutions::new(),
            datapath_id: None,
            changes,
        }
    }

    pub fn datapath_id(&self) -> Option<u64> {
        self.datapath_id
    }

    /// Virtual port bound to datapath port `port_no`.
    pub fn vport(&self, port_no: u32) -> Option<EntityId> {
        self.ports.vport(port_no)
    }

    pub fn sim_context(&self) -> &SimContext {
        &self.ctx
    }

    /// Packets currently waiting on next-hop resolution.
    pub fn held_packets(&self) -> usize {
        self.pending.held()
    }

    /// Serve one switch connection until it closes or `cancel` fires.
    /// Soft state is discarded on every exit.
    pub async fn run<T>(mut self, mut transport: T, cancel: CancellationToken)
    where
        T: Stream<Item = Result<SwitchMessage, ProtoError>>
            + Sink<ControllerMessage, Error = ProtoError>
            + Send
            + Unpin,
    {
        let mut housekeeping =
            tokio::time::interval(self.settings.mac_idle_timeout.clamp(MIN_EXPIRY_INTERVAL, MAX_TIMER));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let out = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                change = self.changes.recv() => match change {
                    Ok(change) => self.handle_topology_change(change),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "topology notifications lagged, dropping soft state");
                        self.ctx.clear();
                        vec![ControllerMessage::FlushFlows]
                    }
                    Err(RecvError::Closed) => break,
                },
                expired = self.pending.next_expired(), if !self.pending.is_empty() => {
                    if let Some((key, held)) = expired {
                        debug!(
                            router = %key.router_id,
                            next_hop = %key.ip,
                            dropped = held.len(),
                            reason = %DropReason::ResolutionTimeout,
                            "next-hop resolution timed out"
                        );
                    }
                    Vec::new()
                }
                _ = housekeeping.tick() => {
                    self.ctx.expire(Instant::now());
                    Vec::new()
                }
                msg = transport.next() => match msg {
                    Some(Ok(msg)) => self.handle_message(msg, Instant::now()),
                    Some(Err(e)) => {
                        warn!(error = %e, datapath = ?self.datapath_id, "switch connection failed");
                        break;
                    }
                    None => break,
                },
            };

            if let Err(e) = send_all(&mut transport, out).await {
                warn!(error = %e, datapath = ?self.datapath_id, "cannot write to switch");
                break;
            }
        }

        self.teardown();
    }

    /// Discard all per-connection state.
    pub fn teardown(&mut self) {
        let held = self.pending.held();
        self.pending.clear();
        self.ctx.clear();
        self.ports.clear();
        info!(datapath = ?self.datapath_id, dropped_held = held, "switch connection closed");
    }

    // ── Inbound messages ─────────────────────────────────────────────

    /// Handle one switch message and return what to send back.
    pub fn handle_message(&mut self, msg: SwitchMessage, now: Instant) -> Vec<ControllerMessage> {
        match msg {
            SwitchMessage::Hello { datapath_id } => {
                info!(datapath = datapath_id, "switch connected");
                self.datapath_id = Some(datapath_id);
                vec![ControllerMessage::FlushFlows]
            }
            SwitchMessage::PortStatus {
                port_no,
                name,
                external_ids,
                removed,
            } => {
                let vport = if removed {
                    None
                } else {
                    external_ids.get(&self.external_id_key).and_then(|raw| match raw.parse() {
                        Ok(id) => Some(id),
                        Err(e) => {
                            warn!(port_no, %name, value = %raw, error = %e, "unparseable virtual port id");
                            None
                        }
                    })
                };
                self.port_status(port_no, &name, vport)
            }
            SwitchMessage::PacketIn {
                buffer_id,
                in_port,
                frame,
            } => self.packet_in(buffer_id, in_port, frame, now),
        }
    }

    fn port_status(&mut self, port_no: u32, name: &str, vport: Option<EntityId>) -> Vec<ControllerMessage> {
        let changed = match vport {
            Some(vport) => {
                let changed = self.ports.bind(port_no, vport);
                if changed {
                    info!(port_no, %name, %vport, "datapath port bound");
                }
                changed
            }
            None => match self.ports.unbind(port_no) {
                Some(old) => {
                    self.ctx.purge_port(old);
                    info!(port_no, %name, vport = %old, "datapath port unbound");
                    true
                }
                None => false,
            },
        };
        if changed {
            vec![ControllerMessage::FlushFlows]
        } else {
            Vec::new()
        }
    }

    fn packet_in(
        &mut self,
        buffer_id: Option<u32>,
        in_port: u32,
        frame: Bytes,
        now: Instant,
    ) -> Vec<ControllerMessage> {
        let Some(ingress) = self.ports.vport(in_port) else {
            debug!(in_port, reason = %DropReason::UnmappedPort, "packet dropped");
            return Vec::new();
        };
        let parsed = match packet::parse(&frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(
                    in_port,
                    reason = %DropReason::Malformed,
                    classification = e.classification(),
                    error = %e,
                    "packet dropped"
                );
                return Vec::new();
            }
        };

        // One snapshot for everything this packet triggers.
        let snapshot = self.cache.snapshot();
        self.process(
            Work::Received(HeldPacket {
                ingress,
                in_port,
                buffer_id,
                packet: parsed,
                frame,
            }),
            &snapshot,
            now,
        )
    }

    /// Invalidate soft state touched by `change` and flush installed flows.
    /// A resync drops all soft state.
    pub fn handle_topology_change(&mut self, change: TopologyChange) -> Vec<ControllerMessage> {
        match change {
            TopologyChange::Entity {
                kind: EntityKind::Port,
                id,
            } => {
                let purged = self.ctx.purge_port(id);
                if purged > 0 {
                    debug!(port = %id, purged, "purged MAC entries of changed port");
                }
            }
            TopologyChange::Resynced => {
                debug!("topology resynced, dropping soft state");
                self.ctx.clear();
            }
            TopologyChange::Entity { .. } | TopologyChange::ZoneMembers { .. } => {}
        }
        trace!(?change, "flushing flows after topology change");
        vec![ControllerMessage::FlushFlows]
    }

    // ── Simulation ───────────────────────────────────────────────────

    fn process(&mut self, first: Work, snapshot: &TopologySnapshot, now: Instant) -> Vec<ControllerMessage> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([first]);
        let mut budget = MAX_WORK_PER_MESSAGE;
        let mut flushed = false;

        while let Some(work) = queue.pop_front() {
            if budget == 0 {
                warn!(remaining = queue.len() + 1, "simulation budget exhausted for one message");
                break;
            }
            budget -= 1;

            let sim = match &work {
                Work::Received(held) => {
                    self.engine
                        .simulate(&held.packet, held.ingress, snapshot, &mut self.ctx, now)
                }
                Work::Generated(emission) => self.engine.inject(emission, snapshot, &mut self.ctx, now),
            };

            if sim.mac_moved && !flushed {
                out.insert(0, ControllerMessage::FlushFlows);
                flushed = true;
            }
            queue.extend(sim.emissions.into_iter().map(Work::Generated));
            for key in &sim.resolved {
                let released = self.pending.take(key);
                if !released.is_empty() {
                    debug!(next_hop = %key.ip, released = released.len(), "next hop resolved");
                }
                queue.extend(released.into_iter().map(Work::Received));
            }

            match (sim.outcome, work) {
                (SimOutcome::Done(FlowVerdict::Accept(egress)), work) => {
                    self.forward(&work, &egress, sim.cacheable, &mut out);
                }
                (SimOutcome::Done(FlowVerdict::Drop(reason)), work) => {
                    debug!(in_port = ?work.in_port(), %reason, "packet dropped");
                }
                (SimOutcome::Done(FlowVerdict::Consumed), _) => {
                    trace!("packet consumed by a virtual device");
                }
                (SimOutcome::Suspended(suspension), Work::Received(held)) => {
                    if let Some(request) = self.suspend(held, suspension) {
                        queue.push_back(Work::Generated(request));
                    }
                }
                (SimOutcome::Suspended(suspension), Work::Generated(_)) => {
                    debug!(next_hop = %suspension.key.ip, "generated packet needs resolution, dropped");
                }
            }
        }
        out
    }

    /// Hold `held` until its next hop resolves. Returns the resolution
    /// request when this is the first packet waiting on it.
    fn suspend(&mut self, held: HeldPacket, suspension: Suspension) -> Option<Emission> {
        let in_port = held.in_port;
        match self.pending.hold(
            suspension.key,
            held,
            self.settings.arp_timeout,
            self.settings.max_pending_per_target,
        ) {
            HoldResult::First => {
                debug!(in_port, next_hop = %suspension.key.ip, "packet suspended, resolving next hop");
                Some(suspension.request)
            }
            HoldResult::Queued => {
                trace!(in_port, next_hop = %suspension.key.ip, "packet queued on pending resolution");
                None
            }
            HoldResult::Overflow => {
                debug!(
                    in_port,
                    next_hop = %suspension.key.ip,
                    reason = %DropReason::ResolutionQueueFull,
                    "packet dropped"
                );
                None
            }
        }
    }

    fn forward(&self, work: &Work, egress: &[Egress], cacheable: bool, out: &mut Vec<ControllerMessage>) {
        let original = match work {
            Work::Received(held) => &held.packet,
            Work::Generated(emission) => &emission.packet,
        };
        let actions = output_actions(&self.ports, original, egress);
        if actions.is_empty() {
            debug!(in_port = ?work.in_port(), reason = %DropReason::NoEgress, "packet dropped");
            return;
        }

        match work {
            Work::Received(held) if cacheable => {
                out.push(ControllerMessage::FlowMod {
                    flow_match: flow_match(held.in_port, original),
                    actions: actions.clone(),
                    idle_timeout_secs: u16::try_from(self.settings.flow_idle_timeout.as_secs())
                        .unwrap_or(u16::MAX),
                    buffer_id: held.buffer_id,
                });
                if held.buffer_id.is_none() {
                    out.push(ControllerMessage::PacketOut {
                        buffer_id: None,
                        in_port: Some(held.in_port),
                        actions,
                        frame: held.frame.clone(),
                    });
                }
            }
            Work::Received(held) => out.push(ControllerMessage::PacketOut {
                buffer_id: held.buffer_id,
                in_port: Some(held.in_port),
                actions,
                frame: held.frame.clone(),
            }),
            Work::Generated(emission) => out.push(ControllerMessage::PacketOut {
                buffer_id: None,
                in_port: None,
                actions,
                frame: packet::serialize(&emission.packet),
            }),
        }
    }
}

/// Datapath actions delivering `packet` to every egress. Header rewrites
/// are emitted relative to what the previous output saw. Outputs go in
/// order of router hops crossed since `DecTtl` is cumulative.
fn output_actions(ports: &PortMap, packet: &Packet, egress: &[Egress]) -> Vec<FlowAction> {
    let mut ordered: Vec<&Egress> = egress.iter().collect();
    ordered.sort_by_key(|out| out.transform.ttl_decrements);

    let original = Headers::of(packet);
    let mut current = original;
    let mut actions = Vec::new();

    for out in ordered {
        let output = match out.tunnel {
            Some(tunnel) => FlowAction::Tunnel {
                kind: tunnel.kind,
                local_ip: tunnel.local_ip,
                remote_ip: tunnel.remote_ip,
                key: tunnel.key,
            },
            None => match ports.port_no(out.port_id) {
                Some(port_no) => FlowAction::Output { port_no },
                None => {
                    debug!(port = %out.port_id, "egress port not on this datapath, skipped");
                    continue;
                }
            },
        };

        let t = out.transform;
        let wanted = Headers {
            eth_src: t.eth_src.unwrap_or(original.eth_src),
            eth_dst: t.eth_dst.unwrap_or(original.eth_dst),
            nw_src: t.nw_src.or(original.nw_src),
            nw_dst: t.nw_dst.or(original.nw_dst),
            ttl_decrements: t.ttl_decrements,
        };
        if wanted.eth_src != current.eth_src {
            actions.push(FlowAction::SetEthSrc { mac: wanted.eth_src });
        }
        if wanted.eth_dst != current.eth_dst {
            actions.push(FlowAction::SetEthDst { mac: wanted.eth_dst });
        }
        if let Some(addr) = wanted.nw_src.filter(|a| Some(*a) != current.nw_src) {
            actions.push(FlowAction::SetNwSrc { addr });
        }
        if let Some(addr) = wanted.nw_dst.filter(|a| Some(*a) != current.nw_dst) {
            actions.push(FlowAction::SetNwDst { addr });
        }
        for _ in current.ttl_decrements..wanted.ttl_decrements {
            actions.push(FlowAction::DecTtl);
        }
        current = wanted;
        actions.push(output);
    }
    actions
}

impl Work {
    fn in_port(&self) -> Option<u32> {
        match self {
            Self::Received(held) => Some(held.in_port),
            Self::Generated(_) => None,
        }
    }
}

/// Rewritable header values as seen by the next output action.
#[derive(Debug, Clone, Copy)]
struct Headers {
    eth_src: MacAddr,
    eth_dst: MacAddr,
    nw_src: Option<Ipv4Addr>,
    nw_dst: Option<Ipv4Addr>,
    ttl_decrements: u8,
}

impl Headers {
    fn of(packet: &Packet) -> Self {
        Self {
            eth_src: packet.eth_src,
            eth_dst: packet.eth_dst,
            nw_src: packet.ipv4().map(|ip| ip.src),
            nw_dst: packet.ipv4().map(|ip| ip.dst),
            ttl_decrements: 0,
        }
    }
}

/// Exact match on every header the simulation could have looked at.
fn flow_match(in_port: u32, packet: &Packet) -> FlowMatch {
    let ip = packet.ipv4();
    let ports = ip.and_then(Ipv4Packet::ports);
    FlowMatch {
        in_port: Some(in_port),
        eth_src: Some(packet.eth_src),
        eth_dst: Some(packet.eth_dst),
        ethertype: Some(packet.ethertype()),
        nw_src: ip.map(|ip| ip.src),
        nw_dst: ip.map(|ip| ip.dst),
        nw_proto: ip.map(Ipv4Packet::protocol),
        tp_src: ports.map(|(src, _)| src),
        tp_dst: ports.map(|(_, dst)| dst),
    }
}

async fn send_all<T>(transport: &mut T, out: Vec<ControllerMessage>) -> Result<(), ProtoError>
where
    T: Sink<ControllerMessage, Error = ProtoError> + Unpin,
{
    if out.is_empty() {
        return Ok(());
    }
    for msg in out {
        transport.feed(msg).await?;
    }
    transport.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use vrn_proto::{EthPayload, IpPayload, UdpDatagram};

    use super::*;
    use crate::sim::Transform;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new([0x02, 0, 0, 0, 0, n])
    }

    fn udp() -> Packet {
        Packet {
            eth_src: mac(1),
            eth_dst: MacAddr::BROADCAST,
            payload: EthPayload::Ipv4(Ipv4Packet {
                tos: 0,
                identification: 1,
                flags_fragment: 0,
                ttl: 64,
                src: [192, 168, 0, 10].into(),
                dst: [192, 168, 0, 255].into(),
                options: Bytes::new(),
                payload: IpPayload::Udp(UdpDatagram {
                    src_port: 68,
                    dst_port: 67,
                    payload: Bytes::new(),
                }),
            }),
        }
    }

    fn egress(port: u128, transform: Transform) -> Egress {
        Egress {
            port_id: EntityId::from_u128(port),
            transform,
            tunnel: None,
        }
    }

    #[test]
    fn outputs_are_ordered_by_router_hops() {
        let mut ports = PortMap::default();
        ports.bind(1, EntityId::from_u128(11));
        ports.bind(2, EntityId::from_u128(12));
        let routed = Transform {
            eth_src: Some(mac(0x52)),
            ttl_decrements: 2,
            ..Transform::default()
        };

        let actions = output_actions(
            &ports,
            &udp(),
            &[egress(11, routed), egress(12, Transform::default())],
        );

        assert_eq!(
            actions,
            vec![
                FlowAction::Output { port_no: 2 },
                FlowAction::SetEthSrc { mac: mac(0x52) },
                FlowAction::DecTtl,
                FlowAction::DecTtl,
                FlowAction::Output { port_no: 1 },
            ]
        );
    }

    #[test]
    fn later_outputs_restore_rewritten_addresses() {
        let mut ports = PortMap::default();
        ports.bind(1, EntityId::from_u128(11));
        ports.bind(2, EntityId::from_u128(12));
        let translated = Transform {
            nw_src: Some([203, 0, 113, 1].into()),
            ..Transform::default()
        };

        let actions = output_actions(
            &ports,
            &udp(),
            &[egress(11, translated), egress(12, Transform::default())],
        );

        assert_eq!(
            actions,
            vec![
                FlowAction::SetNwSrc {
                    addr: [203, 0, 113, 1].into()
                },
                FlowAction::Output { port_no: 1 },
                FlowAction::SetNwSrc {
                    addr: [192, 168, 0, 10].into()
                },
                FlowAction::Output { port_no: 2 },
            ]
        );
    }
}
