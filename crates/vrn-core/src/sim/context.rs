// ── Per-connection soft state ──
//
// MAC-learning tables and the ARP cache one switch connection builds
// up while simulating. Never shared between connections and never
// written back to the topology store.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;
use vrn_proto::MacAddr;

use crate::config::MAX_TIMER;
use crate::model::EntityId;

// ── MAC learning ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MacEntry {
    port_id: EntityId,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    New,
    Refreshed,
    /// The address was last seen on another port.
    Moved { from: EntityId },
}

/// MAC → port associations for one bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacTable {
    entries: HashMap<MacAddr, MacEntry>,
}

impl MacTable {
    pub fn learn(&mut self, mac: MacAddr, port_id: EntityId, now: Instant) -> Learned {
        let previous = self.entries.insert(mac, MacEntry { port_id, last_seen: now });
        match previous {
            None => Learned::New,
            Some(old) if old.port_id == port_id => Learned::Refreshed,
            Some(old) => Learned::Moved { from: old.port_id },
        }
    }

    /// Port last seen for `mac`, unless idle longer than `idle`.
    pub fn lookup(&self, mac: MacAddr, now: Instant, idle: Duration) -> Option<EntityId> {
        self.entries
            .get(&mac)
            .filter(|e| now.saturating_duration_since(e.last_seen) < idle)
            .map(|e| e.port_id)
    }

    /// Forget every address learned on `port_id`.
    pub fn purge_port(&mut self, port_id: EntityId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.port_id != port_id);
        before - self.entries.len()
    }

    pub fn expire(&mut self, now: Instant, idle: Duration) {
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_seen) < idle);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Context ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArpEntry {
    mac: MacAddr,
    expires: Instant,
}

/// Soft state owned by one switch connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimContext {
    mac_idle: Duration,
    arp_ttl: Duration,
    bridges: HashMap<EntityId, MacTable>,
    /// Keyed by (router, next-hop address).
    arp: HashMap<(EntityId, Ipv4Addr), ArpEntry>,
}

impl SimContext {
    /// Both lifetimes are clamped to [`MAX_TIMER`].
    pub fn new(mac_idle: Duration, arp_ttl: Duration) -> Self {
        Self {
            mac_idle: mac_idle.min(MAX_TIMER),
            arp_ttl: arp_ttl.min(MAX_TIMER),
            bridges: HashMap::new(),
            arp: HashMap::new(),
        }
    }

    pub fn mac_idle(&self) -> Duration {
        self.mac_idle
    }

    pub fn mac_table(&self, bridge_id: EntityId) -> Option<&MacTable> {
        self.bridges.get(&bridge_id)
    }

    pub(crate) fn mac_table_mut(&mut self, bridge_id: EntityId) -> &mut MacTable {
        self.bridges.entry(bridge_id).or_default()
    }

    /// Drop MAC entries pointing at `port_id` on every bridge.
    pub fn purge_port(&mut self, port_id: EntityId) -> usize {
        self.bridges
            .values_mut()
            .map(|table| table.purge_port(port_id))
            .sum()
    }

    pub fn arp_lookup(&self, router_id: EntityId, ip: Ipv4Addr, now: Instant) -> Option<MacAddr> {
        self.arp
            .get(&(router_id, ip))
            .filter(|e| now < e.expires)
            .map(|e| e.mac)
    }

    pub fn arp_learn(&mut self, router_id: EntityId, ip: Ipv4Addr, mac: MacAddr, now: Instant) {
        let Some(expires) = now.checked_add(self.arp_ttl) else {
            warn!(router = %router_id, %ip, "ARP entry lifetime overflows the clock, not cached");
            return;
        };
        self.arp.insert((router_id, ip), ArpEntry { mac, expires });
    }

    /// Remove expired MAC and ARP entries.
    pub fn expire(&mut self, now: Instant) {
        let idle = self.mac_idle;
        for table in self.bridges.values_mut() {
            table.expire(now, idle);
        }
        self.bridges.retain(|_, table| !table.is_empty());
        self.arp.retain(|_, e| now < e.expires);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.bridges.clear();
        self.arp.clear();
    }
}
