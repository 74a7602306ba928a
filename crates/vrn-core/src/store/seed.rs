// ── Standalone topology seed ──
//
// A JSON document describing a whole topology, written into an in-memory
// directory so one agent can run without the distributed store.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::info;
use vrn_proto::{DirectoryError, MemoryDirectory};

use super::paths::TopologyPaths;
use crate::error::CoreError;
use crate::model::{
    Bridge, Chain, EntityId, EntityKind, IpAddrGroup, Port, Router, Rule, TopologyEntity,
    TunnelZone,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopologySeed {
    pub bridges: Vec<Bridge>,
    pub routers: Vec<Router>,
    pub ports: Vec<Port>,
    pub chains: Vec<Chain>,
    pub rules: Vec<Rule>,
    pub ip_addr_groups: Vec<IpAddrGroup>,
    /// Zones carry their `members` inline here.
    pub tunnel_zones: Vec<TunnelZone>,
}

impl TopologySeed {
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|e| CoreError::Seed {
            reason: e.to_string(),
        })
    }

    /// Reject dangling references before anything is written.
    pub fn validate(&self) -> Result<(), CoreError> {
        let devices: BTreeSet<EntityId> = self
            .bridges
            .iter()
            .map(|b| b.id)
            .chain(self.routers.iter().map(|r| r.id))
            .collect();
        let ports: BTreeSet<EntityId> = self.ports.iter().map(|p| p.id).collect();
        let chains: BTreeSet<EntityId> = self.chains.iter().map(|c| c.id).collect();
        let groups: BTreeSet<EntityId> = self.ip_addr_groups.iter().map(|g| g.id).collect();

        let dangling = |what: &str, owner: EntityId, target: EntityId| CoreError::Seed {
            reason: format!("{owner} references unknown {what} {target}"),
        };

        for port in &self.ports {
            if !devices.contains(&port.device_id) {
                return Err(dangling("device", port.id, port.device_id));
            }
            if let Some(peer) = port.peer_id().filter(|p| !ports.contains(p)) {
                return Err(dangling("peer port", port.id, peer));
            }
            for chain in [port.inbound_filter, port.outbound_filter].into_iter().flatten() {
                if !chains.contains(&chain) {
                    return Err(dangling("chain", port.id, chain));
                }
            }
        }

        let mut positions = BTreeSet::new();
        for rule in &self.rules {
            if !chains.contains(&rule.chain_id) {
                return Err(dangling("chain", rule.id, rule.chain_id));
            }
            if !positions.insert((rule.chain_id, rule.position)) {
                return Err(CoreError::Seed {
                    reason: format!(
                        "chain {} has two rules at position {}",
                        rule.chain_id, rule.position
                    ),
                });
            }
            for group in [
                rule.condition.ip_addr_group_src,
                rule.condition.ip_addr_group_dst,
            ]
            .into_iter()
            .flatten()
            {
                if !groups.contains(&group) {
                    return Err(dangling("ip address group", rule.id, group));
                }
            }
        }
        Ok(())
    }

    /// Every entity, zones without their members.
    pub fn entities(&self) -> impl Iterator<Item = TopologyEntity> + '_ {
        self.bridges
            .iter()
            .cloned()
            .map(TopologyEntity::Bridge)
            .chain(self.routers.iter().cloned().map(TopologyEntity::Router))
            .chain(self.ports.iter().cloned().map(TopologyEntity::Port))
            .chain(self.chains.iter().cloned().map(TopologyEntity::Chain))
            .chain(self.rules.iter().cloned().map(TopologyEntity::Rule))
            .chain(
                self.ip_addr_groups
                    .iter()
                    .cloned()
                    .map(TopologyEntity::IpAddrGroup),
            )
            .chain(
                self.tunnel_zones
                    .iter()
                    .cloned()
                    .map(TopologyEntity::TunnelZone),
            )
    }

    /// Write the seed into `dir` under `paths`. Existing nodes are replaced.
    pub fn apply(&self, dir: &MemoryDirectory, paths: &TopologyPaths) -> Result<(), CoreError> {
        self.validate()?;

        for kind in EntityKind::iter() {
            dir.ensure_path(&paths.kind_dir(kind))?;
        }

        let mut written = 0usize;
        for entity in self.entities() {
            let path = paths.entity(entity.kind(), entity.id());
            let body = entity.encode().map_err(|e| CoreError::Seed {
                reason: e.to_string(),
            })?;
            put(dir, &path, body)?;
            written += 1;
        }

        for zone in &self.tunnel_zones {
            dir.ensure_path(&paths.zone_members(zone.id))?;
            for (host_id, config) in &zone.members {
                let body = serde_json::to_vec(config).map_err(|e| CoreError::Seed {
                    reason: e.to_string(),
                })?;
                put(dir, &paths.zone_member(zone.id, *host_id), body)?;
                written += 1;
            }
        }

        info!(nodes = written, root = paths.root(), "topology seed written");
        Ok(())
    }
}

fn put(dir: &MemoryDirectory, path: &str, body: Vec<u8>) -> Result<(), DirectoryError> {
    match dir.create(path, body.clone()) {
        Err(DirectoryError::NodeExists { .. }) => dir.update(path, body).map(|_| ()),
        other => other,
    }
}
