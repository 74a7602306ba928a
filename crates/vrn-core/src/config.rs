// ── Runtime agent configuration ──
//
// Resolved settings handed to the core by the binary. The core never
// reads configuration files; `vrn-config` builds an `AgentConfig` and
// passes it in.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::model::EntityId;

/// Longest timer the agent schedules. Larger durations are rejected at
/// load time and clamped by the switch layer.
pub const MAX_TIMER: Duration = Duration::from_secs(2 * 365 * 24 * 60 * 60);

/// How the agent reaches the topology store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// Comma-separated `host:port` list of store servers.
    pub hosts: String,
    pub session_timeout: Duration,
    /// Directory prefix under which every topology node lives.
    pub root_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            hosts: "127.0.0.1:2181".into(),
            session_timeout: Duration::from_millis(30_000),
            root_path: "/vrn".into(),
        }
    }
}

/// Switch-control listener and per-connection soft-state tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchSettings {
    pub listen_addr: SocketAddr,
    /// Idle timeout attached to every installed flow.
    pub flow_idle_timeout: Duration,
    /// Learned MAC entries older than this are ignored.
    pub mac_idle_timeout: Duration,
    /// How long a packet may wait for next-hop resolution.
    pub arp_timeout: Duration,
    pub arp_entry_ttl: Duration,
    /// Held packets per unresolved next hop; extras are dropped.
    pub max_pending_per_target: usize,
}

impl Default for SwitchSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 6633)),
            flow_idle_timeout: Duration::from_secs(60),
            mac_idle_timeout: Duration::from_secs(60),
            arp_timeout: Duration::from_millis(5000),
            arp_entry_ttl: Duration::from_secs(300),
            max_pending_per_target: 32,
        }
    }
}

/// Everything the supervisor needs to run one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Identity of the physical host this agent runs on.
    pub host_id: EntityId,
    /// How long a lost store session may stay unresolved before the
    /// process terminates.
    pub disconnected_grace: Duration,
    /// When off, dynamic-routing port services are hidden from simulation.
    pub enable_dynamic_routing: bool,
    /// Port-status external id naming the virtual port a datapath port
    /// is bound to.
    pub external_id_key: String,
    pub store: StoreSettings,
    pub switch: SwitchSettings,
}

impl AgentConfig {
    pub fn new(host_id: EntityId) -> Self {
        Self {
            host_id,
            disconnected_grace: Duration::from_secs(30),
            enable_dynamic_routing: true,
            external_id_key: "vrn-port-id".into(),
            store: StoreSettings::default(),
            switch: SwitchSettings::default(),
        }
    }
}
