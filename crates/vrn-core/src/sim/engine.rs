// ── Simulation engine ──
//
// Walks a packet through the virtual topology starting at its ingress
// port. Each device step either forwards out of one of its ports (which
// may lead into another device through an interior link), floods, drops,
// absorbs the packet, or suspends it until a next hop resolves.
//
// The engine itself is stateless; soft state lives in the caller's
// `SimContext` and time is passed in, so a run is reproducible for a
// given snapshot, packet, context and instant.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::trace;
use vrn_proto::Packet;

use super::chain::{self, ChainVerdict, apply_rewrite};
use super::context::SimContext;
use super::services::{PortService, PortServiceRegistry};
use super::tunnel::select_tunnel;
use super::verdict::{
    DropReason, Egress, Emission, FlowVerdict, ResolutionKey, SimOutcome, Simulation, Suspension,
    Transform,
};
use super::{bridge, router};
use crate::model::{EntityId, Port, PortBinding};
use crate::store::TopologySnapshot;

/// Device traversals allowed per simulation, flood branches included.
pub const MAX_DEVICE_HOPS: usize = 16;

#[derive(Debug)]
pub struct SimulationEngine {
    host_id: EntityId,
    registry: Arc<PortServiceRegistry>,
}

impl SimulationEngine {
    pub fn new(host_id: EntityId, registry: Arc<PortServiceRegistry>) -> Self {
        Self { host_id, registry }
    }

    pub fn host_id(&self) -> EntityId {
        self.host_id
    }

    /// Simulate `packet` arriving on virtual port `ingress`.
    pub fn simulate(
        &self,
        packet: &Packet,
        ingress: EntityId,
        snapshot: &TopologySnapshot,
        ctx: &mut SimContext,
        now: Instant,
    ) -> Simulation {
        let Some(port) = snapshot.port(ingress) else {
            return Simulation::done(FlowVerdict::Drop(DropReason::TopologyMissing));
        };
        let mut walk = Walk::new(self, snapshot, ctx, now);
        let branch = walk.ingress(port, packet.clone(), Transform::default());
        walk.finish(branch)
    }

    /// Simulate a device-generated packet leaving `emission.from_port`.
    /// Never cacheable.
    pub fn inject(
        &self,
        emission: &Emission,
        snapshot: &TopologySnapshot,
        ctx: &mut SimContext,
        now: Instant,
    ) -> Simulation {
        let Some(port) = snapshot.port(emission.from_port) else {
            return Simulation::done(FlowVerdict::Drop(DropReason::TopologyMissing));
        };
        let mut walk = Walk::new(self, snapshot, ctx, now);
        walk.cacheable = false;
        let branch = walk.egress(port, emission.packet.clone(), Transform::default(), None);
        walk.finish(branch)
    }
}

// ── Walk ────────────────────────────────────────────────────────────

/// Where one path through the topology ended.
#[derive(Debug)]
pub(crate) enum Branch {
    Out(Vec<Egress>),
    Drop(DropReason),
    Consumed,
    Suspended(Suspension),
}

/// Mutable state of one simulation run.
pub(crate) struct Walk<'a> {
    engine: &'a SimulationEngine,
    pub(crate) snapshot: &'a TopologySnapshot,
    pub(crate) ctx: &'a mut SimContext,
    pub(crate) now: Instant,
    hops: usize,
    pub(crate) cacheable: bool,
    pub(crate) emissions: Vec<Emission>,
    pub(crate) resolved: Vec<ResolutionKey>,
    pub(crate) mac_moved: bool,
    /// The registry is consulted at most once per port per run.
    services: HashMap<EntityId, Arc<dyn PortService>>,
}

impl<'a> Walk<'a> {
    fn new(
        engine: &'a SimulationEngine,
        snapshot: &'a TopologySnapshot,
        ctx: &'a mut SimContext,
        now: Instant,
    ) -> Self {
        Self {
            engine,
            snapshot,
            ctx,
            now,
            hops: 0,
            cacheable: true,
            emissions: Vec::new(),
            resolved: Vec::new(),
            mac_moved: false,
            services: HashMap::new(),
        }
    }

    pub(crate) fn service(&mut self, port_id: EntityId) -> Arc<dyn PortService> {
        let registry = &self.engine.registry;
        Arc::clone(
            self.services
                .entry(port_id)
                .or_insert_with(|| registry.service_for(port_id)),
        )
    }

    /// The packet enters the device owning `port` through it.
    pub(crate) fn ingress(
        &mut self,
        port: &'a Arc<Port>,
        mut packet: Packet,
        mut transform: Transform,
    ) -> Branch {
        self.hops += 1;
        if self.hops > MAX_DEVICE_HOPS {
            return Branch::Drop(DropReason::LoopDetected);
        }

        if let Some(chain_id) = port.inbound_filter {
            let verdict =
                chain::evaluate(self.snapshot, chain_id, &mut packet, Some(port.id), &mut transform);
            if let ChainVerdict::Drop(reason) = verdict {
                trace!(port = %port.id, %reason, "inbound filter dropped packet");
                return Branch::Drop(reason);
            }
        }

        let snapshot = self.snapshot;
        if let Some(device) = snapshot.bridge(port.device_id) {
            bridge::process(self, device, port, packet, transform)
        } else if let Some(device) = snapshot.router(port.device_id) {
            router::process(self, device, port, packet, transform)
        } else {
            Branch::Drop(DropReason::TopologyMissing)
        }
    }

    /// The packet leaves its device through `port`. `device_in` is the
    /// port it entered that device by, as seen by outbound filters.
    pub(crate) fn egress(
        &mut self,
        port: &'a Arc<Port>,
        mut packet: Packet,
        mut transform: Transform,
        device_in: Option<EntityId>,
    ) -> Branch {
        if let Some(chain_id) = port.outbound_filter {
            let verdict =
                chain::evaluate(self.snapshot, chain_id, &mut packet, device_in, &mut transform);
            if let ChainVerdict::Drop(reason) = verdict {
                trace!(port = %port.id, %reason, "outbound filter dropped packet");
                return Branch::Drop(reason);
            }
        }

        if port.l3.is_some() {
            for rewrite in self.service(port.id).egress_rewrites(&packet) {
                apply_rewrite(rewrite, &mut packet, &mut transform);
            }
        }

        let snapshot = self.snapshot;
        match &port.binding {
            PortBinding::Exterior { host_id, .. } if *host_id == self.engine.host_id => {
                Branch::Out(vec![Egress {
                    port_id: port.id,
                    transform,
                    tunnel: None,
                }])
            }
            PortBinding::Exterior { host_id, .. } => {
                match select_tunnel(snapshot, self.engine.host_id, *host_id, port) {
                    Some(tunnel) => Branch::Out(vec![Egress {
                        port_id: port.id,
                        transform,
                        tunnel: Some(tunnel),
                    }]),
                    None => Branch::Drop(DropReason::NoRouteToPeerHost),
                }
            }
            PortBinding::Interior { peer_id } => match snapshot.port(*peer_id) {
                Some(peer) => self.ingress(peer, packet, transform),
                None => Branch::Drop(DropReason::TopologyMissing),
            },
            PortBinding::Unbound => Branch::Drop(DropReason::PortUnbound),
        }
    }

    fn finish(self, branch: Branch) -> Simulation {
        let (outcome, cacheable) = match branch {
            Branch::Out(egress) if egress.is_empty() => {
                (SimOutcome::Done(FlowVerdict::Drop(DropReason::NoEgress)), false)
            }
            Branch::Out(egress) => (SimOutcome::Done(FlowVerdict::Accept(egress)), self.cacheable),
            Branch::Drop(reason) => (SimOutcome::Done(FlowVerdict::Drop(reason)), false),
            Branch::Consumed => (SimOutcome::Done(FlowVerdict::Consumed), false),
            Branch::Suspended(suspension) => (SimOutcome::Suspended(suspension), false),
        };
        Simulation {
            outcome,
            cacheable: cacheable && self.emissions.is_empty(),
            emissions: self.emissions,
            resolved: self.resolved,
            mac_moved: self.mac_moved,
        }
    }
}
