// ── Packet simulation ──
//
// Device models (bridge, router), chain evaluation, tunnel selection and
// the per-connection soft state the simulation reads and writes.

mod bridge;
mod chain;
mod context;
mod engine;
mod pending;
mod router;
mod services;
mod tunnel;
mod verdict;

pub use chain::{ChainVerdict, MAX_CHAIN_JUMPS, evaluate};
pub use context::{Learned, MacTable, SimContext};
pub use engine::{MAX_DEVICE_HOPS, SimulationEngine};
pub use pending::{HoldResult, PendingResolutions};
pub use services::{NullPortService, PortService, PortServiceRegistry, ServiceKind};
pub use tunnel::select_tunnel;
pub use verdict::{
    DropReason, Egress, Emission, FlowVerdict, ResolutionKey, SimOutcome, Simulation, Suspension,
    Transform, TunnelEndpoint,
};
