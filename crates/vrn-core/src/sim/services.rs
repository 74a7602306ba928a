// ── Port services ──
//
// Pluggable per-port capabilities (dynamic routing, VPN) that may add
// routes to a router and rewrite packets leaving a port. The services
// themselves live elsewhere; the engine only reads this contract.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use vrn_proto::Packet;

use crate::model::{EntityId, Rewrite, Route};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceKind {
    /// The identity provider.
    None,
    DynamicRouting,
    Vpn,
}

pub trait PortService: Send + Sync + fmt::Debug {
    fn kind(&self) -> ServiceKind;

    /// Routes this service contributes to the port's router.
    fn routes(&self) -> Vec<Route> {
        Vec::new()
    }

    /// Rewrites applied to a packet leaving the port.
    fn egress_rewrites(&self, _packet: &Packet) -> Vec<Rewrite> {
        Vec::new()
    }
}

/// Contributes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPortService;

impl PortService for NullPortService {
    fn kind(&self) -> ServiceKind {
        ServiceKind::None
    }
}

/// Port id → service. Shared by every switch connection.
#[derive(Debug)]
pub struct PortServiceRegistry {
    services: DashMap<EntityId, Arc<dyn PortService>>,
    null: Arc<dyn PortService>,
    dynamic_routing: bool,
}

impl PortServiceRegistry {
    /// With `dynamic_routing` off, dynamic-routing services are hidden.
    pub fn new(dynamic_routing: bool) -> Self {
        Self {
            services: DashMap::new(),
            null: Arc::new(NullPortService),
            dynamic_routing,
        }
    }

    pub fn register(&self, port_id: EntityId, service: Arc<dyn PortService>) {
        debug!(port = %port_id, kind = %service.kind(), "port service registered");
        self.services.insert(port_id, service);
    }

    pub fn unregister(&self, port_id: EntityId) -> Option<Arc<dyn PortService>> {
        self.services.remove(&port_id).map(|(_, service)| service)
    }

    /// The port's service, or the identity provider.
    pub fn service_for(&self, port_id: EntityId) -> Arc<dyn PortService> {
        match self.services.get(&port_id) {
            Some(entry) if self.visible(entry.value().kind()) => Arc::clone(entry.value()),
            _ => Arc::clone(&self.null),
        }
    }

    fn visible(&self, kind: ServiceKind) -> bool {
        kind != ServiceKind::DynamicRouting || self.dynamic_routing
    }
}

impl Default for PortServiceRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}
