// ── Directory layout ──
//
//   <root>/<kind>/<id>                      one node per entity
//   <root>/tunnel_zones/<zone>/members/<host>  HostConfig per member

use vrn_proto::directory::join_path;

use crate::model::{EntityId, EntityKind};

const MEMBERS: &str = "members";

/// What a directory path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathTarget {
    KindDir(EntityKind),
    Entity(EntityKind, EntityId),
    ZoneMembers(EntityId),
    ZoneMember { zone_id: EntityId, host_id: EntityId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPaths {
    root: String,
}

impl TopologyPaths {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        if !root.starts_with('/') {
            root.insert(0, '/');
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn kind_dir(&self, kind: EntityKind) -> String {
        join_path(&self.root, kind.segment())
    }

    pub fn entity(&self, kind: EntityKind, id: EntityId) -> String {
        join_path(&self.kind_dir(kind), &id.to_string())
    }

    pub fn zone_members(&self, zone_id: EntityId) -> String {
        join_path(&self.entity(EntityKind::TunnelZone, zone_id), MEMBERS)
    }

    pub fn zone_member(&self, zone_id: EntityId, host_id: EntityId) -> String {
        join_path(&self.zone_members(zone_id), &host_id.to_string())
    }

    /// Classify a path under the root; `None` for anything else.
    pub fn classify(&self, path: &str) -> Option<PathTarget> {
        let rest = if self.root == "/" {
            path.strip_prefix('/')?
        } else {
            path.strip_prefix(self.root.as_str())?.strip_prefix('/')?
        };
        let segments: Vec<&str> = rest.split('/').collect();
        let kind = |segment: &str| {
            use strum::IntoEnumIterator;
            EntityKind::iter().find(|k| k.segment() == segment)
        };
        match segments.as_slice() {
            [k] => kind(k).map(PathTarget::KindDir),
            [k, id] => Some(PathTarget::Entity(kind(k)?, id.parse().ok()?)),
            [k, zone, m] if *k == EntityKind::TunnelZone.segment() && *m == MEMBERS => {
                Some(PathTarget::ZoneMembers(zone.parse().ok()?))
            }
            [k, zone, m, host] if *k == EntityKind::TunnelZone.segment() && *m == MEMBERS => {
                Some(PathTarget::ZoneMember {
                    zone_id: zone.parse().ok()?,
                    host_id: host.parse().ok()?,
                })
            }
            _ => None,
        }
    }
}
