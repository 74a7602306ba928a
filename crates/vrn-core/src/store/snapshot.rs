// ── Topology snapshot ──
//
// Immutable view of the whole topology. Updates build a new snapshot
// from the old one (maps are cloned, records are shared through `Arc`)
// and the cache swaps the pointer, so a simulation holding a snapshot
// never observes a partial change.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{
    Bridge, Chain, EntityId, EntityKind, HostConfig, IpAddrGroup, Port, Router, Rule,
    TopologyEntity, TunnelZone,
};

#[derive(Debug, Clone, Default)]
pub struct TopologySnapshot {
    generation: u64,
    bridges: BTreeMap<EntityId, Arc<Bridge>>,
    routers: BTreeMap<EntityId, Arc<Router>>,
    ports: BTreeMap<EntityId, Arc<Port>>,
    chains: BTreeMap<EntityId, Arc<Chain>>,
    rules: BTreeMap<EntityId, Arc<Rule>>,
    ip_addr_groups: BTreeMap<EntityId, Arc<IpAddrGroup>>,
    tunnel_zones: BTreeMap<EntityId, Arc<TunnelZone>>,

    // Derived, rebuilt after every change.
    ports_by_device: BTreeMap<EntityId, Vec<EntityId>>,
    rules_by_chain: BTreeMap<EntityId, Vec<Arc<Rule>>>,
}

impl TopologySnapshot {
    pub fn from_entities(entities: impl IntoIterator<Item = TopologyEntity>) -> Self {
        let mut snapshot = Self::default();
        for entity in entities {
            snapshot.insert(entity);
        }
        snapshot.reindex();
        snapshot
    }

    /// Copy with one entity added or replaced.
    pub fn with_entity(&self, entity: TopologyEntity) -> Self {
        let mut next = self.clone();
        next.insert(entity);
        next.reindex();
        next.generation += 1;
        next
    }

    /// Copy with one entity removed. Removing an absent entity still
    /// yields a new generation.
    pub fn without_entity(&self, kind: EntityKind, id: EntityId) -> Self {
        let mut next = self.clone();
        match kind {
            EntityKind::Bridge => {
                next.bridges.remove(&id);
            }
            EntityKind::Router => {
                next.routers.remove(&id);
            }
            EntityKind::Port => {
                next.ports.remove(&id);
            }
            EntityKind::Chain => {
                next.chains.remove(&id);
            }
            EntityKind::Rule => {
                next.rules.remove(&id);
            }
            EntityKind::IpAddrGroup => {
                next.ip_addr_groups.remove(&id);
            }
            EntityKind::TunnelZone => {
                next.tunnel_zones.remove(&id);
            }
        }
        next.reindex();
        next.generation += 1;
        next
    }

    /// Copy with a zone's membership replaced; `None` if the zone is unknown.
    pub fn with_zone_members(
        &self,
        zone_id: EntityId,
        members: BTreeMap<EntityId, HostConfig>,
    ) -> Option<Self> {
        let zone = self.tunnel_zones.get(&zone_id)?;
        let mut zone = TunnelZone::clone(zone);
        zone.members = members;
        Some(self.with_entity(TopologyEntity::TunnelZone(zone)))
    }

    /// Carry the generation counter over from a snapshot this one replaces.
    pub(crate) fn succeeding(mut self, previous: &Self) -> Self {
        self.generation = previous.generation + 1;
        self
    }

    fn insert(&mut self, entity: TopologyEntity) {
        match entity {
            TopologyEntity::Bridge(e) => {
                self.bridges.insert(e.id, Arc::new(e));
            }
            TopologyEntity::Router(e) => {
                self.routers.insert(e.id, Arc::new(e));
            }
            TopologyEntity::Port(e) => {
                self.ports.insert(e.id, Arc::new(e));
            }
            TopologyEntity::Chain(e) => {
                self.chains.insert(e.id, Arc::new(e));
            }
            TopologyEntity::Rule(e) => {
                self.rules.insert(e.id, Arc::new(e));
            }
            TopologyEntity::IpAddrGroup(e) => {
                self.ip_addr_groups.insert(e.id, Arc::new(e));
            }
            TopologyEntity::TunnelZone(e) => {
                self.tunnel_zones.insert(e.id, Arc::new(e));
            }
        }
    }

    fn reindex(&mut self) {
        let mut ports_by_device: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
        for port in self.ports.values() {
            ports_by_device.entry(port.device_id).or_default().push(port.id);
        }

        let mut rules_by_chain: BTreeMap<EntityId, Vec<Arc<Rule>>> = BTreeMap::new();
        for rule in self.rules.values() {
            rules_by_chain
                .entry(rule.chain_id)
                .or_default()
                .push(Arc::clone(rule));
        }
        for rules in rules_by_chain.values_mut() {
            rules.sort_by_key(|r| (r.position, r.id));
        }

        self.ports_by_device = ports_by_device;
        self.rules_by_chain = rules_by_chain;
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Bumps on every change; two snapshots of one cache with the same
    /// generation hold the same topology.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bridge(&self, id: EntityId) -> Option<&Arc<Bridge>> {
        self.bridges.get(&id)
    }

    pub fn router(&self, id: EntityId) -> Option<&Arc<Router>> {
        self.routers.get(&id)
    }

    pub fn port(&self, id: EntityId) -> Option<&Arc<Port>> {
        self.ports.get(&id)
    }

    pub fn chain(&self, id: EntityId) -> Option<&Arc<Chain>> {
        self.chains.get(&id)
    }

    pub fn ip_addr_group(&self, id: EntityId) -> Option<&Arc<IpAddrGroup>> {
        self.ip_addr_groups.get(&id)
    }

    pub fn tunnel_zone(&self, id: EntityId) -> Option<&Arc<TunnelZone>> {
        self.tunnel_zones.get(&id)
    }

    /// Zones in ascending id order.
    pub fn tunnel_zones(&self) -> impl Iterator<Item = &Arc<TunnelZone>> {
        self.tunnel_zones.values()
    }

    /// Ports owned by a device, in ascending id order.
    pub fn device_ports(&self, device_id: EntityId) -> &[EntityId] {
        self.ports_by_device
            .get(&device_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Rules of a chain in position order.
    pub fn chain_rules(&self, chain_id: EntityId) -> &[Arc<Rule>] {
        self.rules_by_chain
            .get(&chain_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The port an interior port is linked to.
    pub fn peer(&self, port: &Port) -> Option<&Arc<Port>> {
        port.peer_id().and_then(|id| self.port(id))
    }

    /// Ids of every cached entity of one kind.
    pub fn ids(&self, kind: EntityKind) -> Vec<EntityId> {
        match kind {
            EntityKind::Bridge => self.bridges.keys().copied().collect(),
            EntityKind::Router => self.routers.keys().copied().collect(),
            EntityKind::Port => self.ports.keys().copied().collect(),
            EntityKind::Chain => self.chains.keys().copied().collect(),
            EntityKind::Rule => self.rules.keys().copied().collect(),
            EntityKind::IpAddrGroup => self.ip_addr_groups.keys().copied().collect(),
            EntityKind::TunnelZone => self.tunnel_zones.keys().copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
            + self.routers.len()
            + self.ports.len()
            + self.chains.len()
            + self.rules.len()
            + self.ip_addr_groups.len()
            + self.tunnel_zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{RuleAction, RuleCondition};

    fn id(n: u128) -> EntityId {
        EntityId::from_u128(n)
    }

    fn rule(n: u128, chain: u128, position: u32) -> TopologyEntity {
        TopologyEntity::Rule(Rule {
            id: id(n),
            chain_id: id(chain),
            position,
            condition: RuleCondition::default(),
            action: RuleAction::Accept,
        })
    }

    #[test]
    fn rules_are_ordered_by_position_not_id() {
        let snapshot = TopologySnapshot::from_entities([
            rule(1, 100, 30),
            rule(2, 100, 10),
            rule(3, 100, 20),
            rule(4, 200, 1),
        ]);
        let order: Vec<EntityId> = snapshot.chain_rules(id(100)).iter().map(|r| r.id).collect();
        assert_eq!(order, [id(2), id(3), id(1)]);
        assert_eq!(snapshot.chain_rules(id(200)).len(), 1);
        assert!(snapshot.chain_rules(id(300)).is_empty());
    }

    #[test]
    fn updates_leave_the_original_untouched() {
        let base = TopologySnapshot::from_entities([rule(1, 100, 1)]);
        let next = base.with_entity(rule(2, 100, 2));
        assert_eq!(base.chain_rules(id(100)).len(), 1);
        assert_eq!(next.chain_rules(id(100)).len(), 2);
        assert_eq!(next.generation(), base.generation() + 1);

        let removed = next.without_entity(EntityKind::Rule, id(1));
        assert_eq!(removed.chain_rules(id(100)).len(), 1);
        assert_eq!(next.chain_rules(id(100)).len(), 2);
    }
}
