// vrn-core: Topology snapshot cache, packet simulation, switch control
// and the session supervisor of the VRN agent.

pub mod acceptor;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod sim;
pub mod store;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use acceptor::{ConnectionAcceptor, SwitchConnection};
pub use config::{AgentConfig, MAX_TIMER, StoreSettings, SwitchSettings};
pub use controller::SwitchController;
pub use error::CoreError;
pub use sim::{
    DropReason, Egress, Emission, FlowVerdict, NullPortService, PortService, PortServiceRegistry,
    ServiceKind, SimContext, SimOutcome, Simulation, SimulationEngine, Transform,
    TunnelEndpoint,
};
pub use store::{TopologyCache, TopologyChange, TopologyPaths, TopologySeed, TopologySnapshot};
pub use supervisor::{
    AgentEvent, Effect, SessionMachine, SessionState, SessionSupervisor, SupervisorExit,
    TerminationReason,
};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    Bridge, Chain, EntityId, EntityKind, HostConfig, IpAddrGroup, NextHop, Port, PortBinding,
    Rewrite, Route, Router, RouterPortAddress, Rule, RuleAction, RuleCondition, TopologyEntity,
    TunnelZone,
};
