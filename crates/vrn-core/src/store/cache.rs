// ── Watch-driven topology cache ──
//
// Holds the current `TopologySnapshot` behind an atomic pointer. Every
// node read arms a one-shot watch first; when it fires, the pump task
// re-reads that node (arming the next watch), builds a new snapshot and
// swaps it in. Readers pin whatever snapshot is current when they start.
//
// A read that fails because the session is down keeps the previous
// value. The supervisor calls `resync()` after reconnecting, which
// reloads everything and re-arms every watch.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use strum::IntoEnumIterator;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vrn_proto::{DirectoryError, TopologyStore, WatchEvent, WatchSender};

use super::paths::{PathTarget, TopologyPaths};
use super::snapshot::TopologySnapshot;
use crate::error::CoreError;
use crate::model::{EntityId, EntityKind, HostConfig, TopologyEntity};

const CHANGE_CHANNEL_SIZE: usize = 256;

/// Broadcast after each snapshot swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    /// One entity was added, replaced or removed.
    Entity { kind: EntityKind, id: EntityId },
    /// A tunnel zone's membership changed.
    ZoneMembers { zone_id: EntityId },
    /// The whole topology was reloaded.
    Resynced,
}

/// Result of reading one entity node.
enum Loaded {
    Entity(TopologyEntity),
    Missing,
    Malformed(String),
}

pub struct TopologyCache {
    store: Arc<dyn TopologyStore>,
    paths: TopologyPaths,
    current: ArcSwap<TopologySnapshot>,
    changes: broadcast::Sender<TopologyChange>,
    watch_tx: WatchSender,
    watch_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    /// Serializes read-modify-swap so concurrent updates never lose each other.
    update: Mutex<()>,
}

impl std::fmt::Debug for TopologyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyCache")
            .field("paths", &self.paths)
            .field("generation", &self.current.load().generation())
            .finish_non_exhaustive()
    }
}

impl TopologyCache {
    pub fn new(store: Arc<dyn TopologyStore>, paths: TopologyPaths) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        Self {
            store,
            paths,
            current: ArcSwap::from_pointee(TopologySnapshot::default()),
            changes,
            watch_tx,
            watch_rx: tokio::sync::Mutex::new(Some(watch_rx)),
            update: Mutex::new(()),
        }
    }

    /// Pin the current snapshot.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.load_full()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyChange> {
        self.changes.subscribe()
    }

    pub fn paths(&self) -> &TopologyPaths {
        &self.paths
    }

    // ── Full load ────────────────────────────────────────────────────

    /// Reload every entity and re-arm every watch.
    pub fn resync(&self) -> Result<(), CoreError> {
        let _guard = self.update.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entities = Vec::new();
        for kind in EntityKind::iter() {
            for id in self.list_kind(kind)? {
                match self.load_entity(kind, id)? {
                    Loaded::Entity(entity) => entities.push(entity),
                    Loaded::Missing => {}
                    Loaded::Malformed(reason) => {
                        warn!(%kind, %id, %reason, "skipping malformed topology node");
                    }
                }
            }
        }

        let previous = self.current.load();
        let next = TopologySnapshot::from_entities(entities).succeeding(&previous);
        info!(
            entities = next.len(),
            generation = next.generation(),
            "topology loaded"
        );
        self.current.store(Arc::new(next));
        let _ = self.changes.send(TopologyChange::Resynced);
        Ok(())
    }

    // ── Watch pump ───────────────────────────────────────────────────

    /// Consume fired watches until cancelled. Only the first call runs.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.watch_rx.lock().await.take() else {
            warn!("topology watch pump already running");
            return;
        };
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_watch(&event),
                    None => break,
                },
            }
        }
        debug!("topology watch pump stopped");
    }

    /// Apply one fired watch.
    pub fn handle_watch(&self, event: &WatchEvent) {
        let Some(target) = self.paths.classify(&event.path) else {
            debug!(path = %event.path, "ignoring watch outside topology root");
            return;
        };
        debug!(path = %event.path, kind = ?event.kind, "topology watch fired");

        let _guard = self.update.lock().unwrap_or_else(PoisonError::into_inner);
        let outcome = match target {
            PathTarget::KindDir(kind) => self.refresh_kind(kind),
            PathTarget::Entity(kind, id) => self.refresh_entity(kind, id),
            PathTarget::ZoneMembers(zone_id) | PathTarget::ZoneMember { zone_id, .. } => {
                self.refresh_members(zone_id)
            }
        };
        if let Err(e) = outcome {
            warn!(path = %event.path, error = %e, "topology refresh failed, keeping cached value");
        }
    }

    fn refresh_kind(&self, kind: EntityKind) -> Result<(), DirectoryError> {
        let listed = self.list_kind(kind)?;
        let cached: BTreeSet<EntityId> = self.current.load().ids(kind).into_iter().collect();

        for id in listed.difference(&cached) {
            self.refresh_entity(kind, *id)?;
        }
        for id in cached.difference(&listed) {
            self.publish(
                self.current.load().without_entity(kind, *id),
                TopologyChange::Entity { kind, id: *id },
            );
        }
        Ok(())
    }

    fn refresh_entity(&self, kind: EntityKind, id: EntityId) -> Result<(), DirectoryError> {
        let next = match self.load_entity(kind, id)? {
            Loaded::Entity(entity) => self.current.load().with_entity(entity),
            Loaded::Missing => self.current.load().without_entity(kind, id),
            Loaded::Malformed(reason) => {
                warn!(%kind, %id, %reason, "malformed topology node, keeping cached value");
                return Ok(());
            }
        };
        self.publish(next, TopologyChange::Entity { kind, id });
        Ok(())
    }

    fn refresh_members(&self, zone_id: EntityId) -> Result<(), DirectoryError> {
        let members = self.load_members(zone_id)?;
        if let Some(next) = self.current.load().with_zone_members(zone_id, members) {
            self.publish(next, TopologyChange::ZoneMembers { zone_id });
        }
        Ok(())
    }

    fn publish(&self, next: TopologySnapshot, change: TopologyChange) {
        debug!(generation = next.generation(), ?change, "topology updated");
        self.current.store(Arc::new(next));
        let _ = self.changes.send(change);
    }

    // ── Node reads (each arms its watch before reading) ──────────────

    fn list_kind(&self, kind: EntityKind) -> Result<BTreeSet<EntityId>, DirectoryError> {
        let dir = self.paths.kind_dir(kind);
        match self.store.watch_children(&dir, self.watch_tx.clone()) {
            Ok(()) => {}
            Err(DirectoryError::NoNode { .. }) => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        }
        let names = match self.store.children(&dir) {
            Ok(names) => names,
            Err(DirectoryError::NoNode { .. }) => return Ok(BTreeSet::new()),
            Err(e) => return Err(e),
        };
        Ok(names
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(%dir, %name, "ignoring topology node with a non-UUID name");
                    None
                }
            })
            .collect())
    }

    fn load_entity(&self, kind: EntityKind, id: EntityId) -> Result<Loaded, DirectoryError> {
        let path = self.paths.entity(kind, id);
        match self.store.watch_data(&path, self.watch_tx.clone()) {
            Ok(()) => {}
            Err(DirectoryError::NoNode { .. }) => return Ok(Loaded::Missing),
            Err(e) => return Err(e),
        }
        let (data, version) = match self.store.read(&path) {
            Ok(read) => read,
            Err(DirectoryError::NoNode { .. }) => return Ok(Loaded::Missing),
            Err(e) => return Err(e),
        };

        let mut entity = match TopologyEntity::decode(kind, &data) {
            Ok(entity) => entity,
            Err(e) => return Ok(Loaded::Malformed(e.to_string())),
        };
        if entity.id() != id {
            return Ok(Loaded::Malformed(format!(
                "record id {} does not match node name",
                entity.id()
            )));
        }
        match &mut entity {
            TopologyEntity::IpAddrGroup(group) => group.version = version,
            TopologyEntity::TunnelZone(zone) => zone.members = self.load_members(id)?,
            _ => {}
        }
        Ok(Loaded::Entity(entity))
    }

    fn load_members(
        &self,
        zone_id: EntityId,
    ) -> Result<BTreeMap<EntityId, HostConfig>, DirectoryError> {
        let dir = self.paths.zone_members(zone_id);
        match self.store.watch_children(&dir, self.watch_tx.clone()) {
            Ok(()) => {}
            Err(DirectoryError::NoNode { .. }) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        }
        let names = match self.store.children(&dir) {
            Ok(names) => names,
            Err(DirectoryError::NoNode { .. }) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut members = BTreeMap::new();
        for name in names {
            let Ok(host_id) = name.parse::<EntityId>() else {
                warn!(%zone_id, %name, "ignoring zone member with a non-UUID name");
                continue;
            };
            let path = self.paths.zone_member(zone_id, host_id);
            match self.store.watch_data(&path, self.watch_tx.clone()) {
                Ok(()) => {}
                Err(DirectoryError::NoNode { .. }) => continue,
                Err(e) => return Err(e),
            }
            let data = match self.store.read(&path) {
                Ok((data, _)) => data,
                Err(DirectoryError::NoNode { .. }) => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<HostConfig>(&data) {
                Ok(config) => {
                    members.insert(host_id, config);
                }
                Err(e) => warn!(%zone_id, %host_id, error = %e, "malformed zone membership"),
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use vrn_proto::{MemoryDirectory, SessionEvent, TunnelKind, WatchKind};

    use super::*;
    use crate::model::{Bridge, TunnelZone};
    use crate::store::TopologySeed;

    const ZONE: EntityId = EntityId::from_u128(0xa1);

    fn id(n: u128) -> EntityId {
        EntityId::from_u128(n)
    }

    fn bridge(n: u128, name: &str) -> Bridge {
        Bridge {
            id: id(n),
            name: name.into(),
        }
    }

    fn member(last: u8) -> HostConfig {
        HostConfig {
            ip: Ipv4Addr::new(192, 0, 2, last),
        }
    }

    fn seed() -> TopologySeed {
        TopologySeed {
            bridges: vec![bridge(1, "tenant")],
            tunnel_zones: vec![TunnelZone {
                id: ZONE,
                name: "gre-zone".into(),
                kind: TunnelKind::Gre,
                members: BTreeMap::from([(id(0xf1), member(1))]),
            }],
            ..TopologySeed::default()
        }
    }

    fn loaded() -> (Arc<MemoryDirectory>, TopologyCache) {
        let dir = Arc::new(MemoryDirectory::new());
        dir.open().unwrap();
        let paths = TopologyPaths::new("/vrn");
        seed().apply(&dir, &paths).unwrap();
        let cache = TopologyCache::new(dir.clone(), paths);
        cache.resync().unwrap();
        (dir, cache)
    }

    fn fire(cache: &TopologyCache, path: String, kind: WatchKind) {
        cache.handle_watch(&WatchEvent { path, kind });
    }

    fn encode(entity: TopologyEntity) -> Vec<u8> {
        entity.encode().unwrap()
    }

    // ── Child sets ───────────────────────────────────────────────────

    #[test]
    fn created_entity_appears_and_is_announced() {
        let (dir, cache) = loaded();
        let mut changes = cache.subscribe();
        let path = cache.paths().entity(EntityKind::Bridge, id(2));
        dir.create(&path, encode(TopologyEntity::Bridge(bridge(2, "new"))))
            .unwrap();

        fire(&cache, cache.paths().kind_dir(EntityKind::Bridge), WatchKind::Children);

        assert_eq!(cache.snapshot().bridge(id(2)).unwrap().name, "new");
        assert_eq!(
            changes.try_recv().unwrap(),
            TopologyChange::Entity {
                kind: EntityKind::Bridge,
                id: id(2)
            }
        );
    }

    #[test]
    fn deleted_entity_disappears_without_leaving_a_watch() {
        let (dir, cache) = loaded();
        let mut changes = cache.subscribe();
        let path = cache.paths().entity(EntityKind::Bridge, id(1));
        dir.delete(&path).unwrap();

        fire(&cache, cache.paths().kind_dir(EntityKind::Bridge), WatchKind::Children);
        assert!(cache.snapshot().bridge(id(1)).is_none());
        assert_eq!(
            changes.try_recv().unwrap(),
            TopologyChange::Entity {
                kind: EntityKind::Bridge,
                id: id(1)
            }
        );

        // The node's own data watch fired too; handling it arms nothing.
        let armed = dir.armed_watches();
        fire(&cache, path, WatchKind::Data);
        assert_eq!(dir.armed_watches(), armed);
        assert!(cache.snapshot().bridge(id(1)).is_none());
    }

    // ── Zone membership ──────────────────────────────────────────────

    #[test]
    fn zone_members_follow_the_directory() {
        let (dir, cache) = loaded();
        let mut changes = cache.subscribe();
        let members = cache.paths().zone_members(ZONE);

        let joined = cache.paths().zone_member(ZONE, id(0xf2));
        dir.create(&joined, serde_json::to_vec(&member(2)).unwrap())
            .unwrap();
        fire(&cache, members.clone(), WatchKind::Children);

        let zone = cache.snapshot().tunnel_zone(ZONE).unwrap().clone();
        assert_eq!(
            zone.members,
            BTreeMap::from([(id(0xf1), member(1)), (id(0xf2), member(2))])
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            TopologyChange::ZoneMembers { zone_id: ZONE }
        );

        dir.delete(&cache.paths().zone_member(ZONE, id(0xf1))).unwrap();
        fire(&cache, members, WatchKind::Children);

        let zone = cache.snapshot().tunnel_zone(ZONE).unwrap().clone();
        assert_eq!(zone.members, BTreeMap::from([(id(0xf2), member(2))]));
        assert_eq!(
            changes.try_recv().unwrap(),
            TopologyChange::ZoneMembers { zone_id: ZONE }
        );
    }

    #[test]
    fn member_data_change_refreshes_the_zone() {
        let (dir, cache) = loaded();
        let path = cache.paths().zone_member(ZONE, id(0xf1));
        dir.update(&path, serde_json::to_vec(&member(9)).unwrap())
            .unwrap();

        fire(&cache, path, WatchKind::Data);

        let zone = cache.snapshot().tunnel_zone(ZONE).unwrap().clone();
        assert_eq!(zone.members.get(&id(0xf1)), Some(&member(9)));
    }

    // ── Session loss ─────────────────────────────────────────────────

    #[test]
    fn refresh_during_connection_loss_keeps_cached_value() {
        let (dir, cache) = loaded();
        let mut changes = cache.subscribe();
        let generation = cache.snapshot().generation();
        let path = cache.paths().entity(EntityKind::Bridge, id(1));
        dir.update(&path, encode(TopologyEntity::Bridge(bridge(1, "renamed"))))
            .unwrap();

        dir.inject_session_event(SessionEvent::Disconnected);
        fire(&cache, path.clone(), WatchKind::Data);

        assert_eq!(cache.snapshot().bridge(id(1)).unwrap().name, "tenant");
        assert_eq!(cache.snapshot().generation(), generation);
        assert!(changes.try_recv().is_err());

        dir.inject_session_event(SessionEvent::Connected);
        fire(&cache, path, WatchKind::Data);

        assert_eq!(cache.snapshot().bridge(id(1)).unwrap().name, "renamed");
        assert_eq!(
            changes.try_recv().unwrap(),
            TopologyChange::Entity {
                kind: EntityKind::Bridge,
                id: id(1)
            }
        );
    }
}
