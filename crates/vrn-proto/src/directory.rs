// ── Topology directory contract ──
//
// Hierarchical, versioned, watchable node store with session semantics.
// The agent only ever reads from it; writes exist so tools and tests can
// seed and mutate a topology.
//
// Watches are one-shot: a registration fires at most once and must be
// re-armed by the receiver after it handles the notification.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::DirectoryError;

const SESSION_CHANNEL_SIZE: usize = 16;

// ── Events ──────────────────────────────────────────────────────────

/// Out-of-band session state notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// The node's data changed or the node was deleted.
    Data,
    /// A child was created or deleted under the node.
    Children,
}

/// A fired one-shot watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

pub type WatchSender = mpsc::UnboundedSender<WatchEvent>;

// ── Contract ────────────────────────────────────────────────────────

/// What the agent consumes from the distributed topology store.
pub trait TopologyStore: Send + Sync {
    /// Open the session. Idempotent.
    fn open(&self) -> Result<(), DirectoryError>;

    /// Close the session and drop every registered watch.
    fn close(&self);

    /// Node data and its version.
    fn read(&self, path: &str) -> Result<(Bytes, u64), DirectoryError>;

    /// Names (not full paths) of the node's children.
    fn children(&self, path: &str) -> Result<BTreeSet<String>, DirectoryError>;

    /// Register a one-shot watch on the node's data. Fails with
    /// `NoNode` if the node does not exist.
    fn watch_data(&self, path: &str, watcher: WatchSender) -> Result<(), DirectoryError>;

    /// Register a one-shot watch on the node's child set. Fails with
    /// `NoNode` if the node does not exist.
    fn watch_children(&self, path: &str, watcher: WatchSender) -> Result<(), DirectoryError>;

    /// Subscribe to session state changes.
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;
}

// ── Path helpers ────────────────────────────────────────────────────

/// Parent of an absolute path, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of an absolute path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a child name onto a parent path.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

// ── In-memory implementation ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Closed,
    Connected,
    Disconnected,
    Expired,
}

#[derive(Debug, Default)]
struct Node {
    data: Bytes,
    version: u64,
    children: BTreeSet<String>,
}

#[derive(Debug)]
struct State {
    liveness: Liveness,
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<WatchSender>>,
    child_watches: HashMap<String, Vec<WatchSender>>,
}

/// A single-process [`TopologyStore`].
///
/// Starts closed with only the root node. [`inject_session_event`] lets a
/// caller simulate connection loss, resynchronization and expiry; while
/// not connected every read fails the way a real client would.
///
/// [`inject_session_event`]: MemoryDirectory::inject_session_event
#[derive(Debug)]
pub struct MemoryDirectory {
    state: Mutex<State>,
    session: broadcast::Sender<SessionEvent>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::default());
        let (session, _) = broadcast::channel(SESSION_CHANNEL_SIZE);
        Self {
            state: Mutex::new(State {
                liveness: Liveness::Closed,
                nodes,
                data_watches: HashMap::new(),
                child_watches: HashMap::new(),
            }),
            session,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a node. The parent must exist.
    pub fn create(&self, path: &str, data: impl Into<Bytes>) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        let parent = parent_path(path).ok_or_else(|| DirectoryError::NodeExists {
            path: path.to_owned(),
        })?;
        if state.nodes.contains_key(path) {
            return Err(DirectoryError::NodeExists {
                path: path.to_owned(),
            });
        }
        let Some(parent_node) = state.nodes.get_mut(parent) else {
            return Err(DirectoryError::NoParent {
                path: path.to_owned(),
            });
        };
        parent_node.children.insert(node_name(path).to_owned());
        state.nodes.insert(
            path.to_owned(),
            Node {
                data: data.into(),
                version: 0,
                children: BTreeSet::new(),
            },
        );
        let parent = parent.to_owned();
        fire(&mut state.child_watches, &parent, WatchKind::Children);
        Ok(())
    }

    /// Create every missing node along `path`, with empty data.
    pub fn ensure_path(&self, path: &str) -> Result<(), DirectoryError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.create(&current, Bytes::new()) {
                Ok(()) | Err(DirectoryError::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Replace a node's data, bumping its version.
    pub fn update(&self, path: &str, data: impl Into<Bytes>) -> Result<u64, DirectoryError> {
        let mut state = self.lock();
        let Some(node) = state.nodes.get_mut(path) else {
            return Err(DirectoryError::NoNode {
                path: path.to_owned(),
            });
        };
        node.data = data.into();
        node.version += 1;
        let version = node.version;
        fire(&mut state.data_watches, path, WatchKind::Data);
        Ok(version)
    }

    /// Delete a leaf node.
    pub fn delete(&self, path: &str) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        match state.nodes.get(path) {
            None => {
                return Err(DirectoryError::NoNode {
                    path: path.to_owned(),
                });
            }
            Some(node) if !node.children.is_empty() => {
                return Err(DirectoryError::NotEmpty {
                    path: path.to_owned(),
                });
            }
            Some(_) => {}
        }
        state.nodes.remove(path);
        fire(&mut state.data_watches, path, WatchKind::Data);
        if let Some(parent) = parent_path(path) {
            if let Some(parent_node) = state.nodes.get_mut(parent) {
                parent_node.children.remove(node_name(path));
            }
            fire(&mut state.child_watches, parent, WatchKind::Children);
        }
        Ok(())
    }

    /// Drive the session state from outside, as the store's client
    /// library would on connection loss, resync or lease expiry.
    pub fn inject_session_event(&self, event: SessionEvent) {
        {
            let mut state = self.lock();
            state.liveness = match event {
                SessionEvent::Connected => Liveness::Connected,
                SessionEvent::Disconnected => Liveness::Disconnected,
                SessionEvent::Expired => {
                    state.data_watches.clear();
                    state.child_watches.clear();
                    Liveness::Expired
                }
            };
        }
        debug!(%event, "directory session event");
        let _ = self.session.send(event);
    }

    /// Number of armed watches, data and children combined.
    pub fn armed_watches(&self) -> usize {
        let state = self.lock();
        state.data_watches.values().map(Vec::len).sum::<usize>()
            + state.child_watches.values().map(Vec::len).sum::<usize>()
    }

    fn check_live(state: &State) -> Result<(), DirectoryError> {
        match state.liveness {
            Liveness::Connected => Ok(()),
            Liveness::Closed | Liveness::Disconnected => Err(DirectoryError::ConnectionLoss),
            Liveness::Expired => Err(DirectoryError::SessionExpired),
        }
    }
}

/// The same channel registered twice on one node is one registration.
fn arm(watches: &mut HashMap<String, Vec<WatchSender>>, path: &str, watcher: WatchSender) {
    let senders = watches.entry(path.to_owned()).or_default();
    if !senders.iter().any(|s| s.same_channel(&watcher)) {
        senders.push(watcher);
    }
}

fn fire(watches: &mut HashMap<String, Vec<WatchSender>>, path: &str, kind: WatchKind) {
    if let Some(senders) = watches.remove(path) {
        for sender in senders {
            let _ = sender.send(WatchEvent {
                path: path.to_owned(),
                kind,
            });
        }
    }
}

impl TopologyStore for MemoryDirectory {
    fn open(&self) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        match state.liveness {
            Liveness::Expired => Err(DirectoryError::SessionExpired),
            Liveness::Connected => Ok(()),
            Liveness::Closed | Liveness::Disconnected => {
                state.liveness = Liveness::Connected;
                drop(state);
                let _ = self.session.send(SessionEvent::Connected);
                Ok(())
            }
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.liveness = Liveness::Closed;
        state.data_watches.clear();
        state.child_watches.clear();
    }

    fn read(&self, path: &str) -> Result<(Bytes, u64), DirectoryError> {
        let state = self.lock();
        Self::check_live(&state)?;
        state
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.version))
            .ok_or_else(|| DirectoryError::NoNode {
                path: path.to_owned(),
            })
    }

    fn children(&self, path: &str) -> Result<BTreeSet<String>, DirectoryError> {
        let state = self.lock();
        Self::check_live(&state)?;
        state
            .nodes
            .get(path)
            .map(|node| node.children.clone())
            .ok_or_else(|| DirectoryError::NoNode {
                path: path.to_owned(),
            })
    }

    fn watch_data(&self, path: &str, watcher: WatchSender) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        Self::check_live(&state)?;
        if !state.nodes.contains_key(path) {
            return Err(DirectoryError::NoNode {
                path: path.to_owned(),
            });
        }
        arm(&mut state.data_watches, path, watcher);
        Ok(())
    }

    fn watch_children(&self, path: &str, watcher: WatchSender) -> Result<(), DirectoryError> {
        let mut state = self.lock();
        Self::check_live(&state)?;
        if !state.nodes.contains_key(path) {
            return Err(DirectoryError::NoNode {
                path: path.to_owned(),
            });
        }
        arm(&mut state.child_watches, path, watcher);
        Ok(())
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_dir() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.open().unwrap();
        dir
    }

    #[test]
    fn path_helpers() {
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b"), "b");
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
    }

    #[test]
    fn update_bumps_version() {
        let dir = open_dir();
        dir.create("/x", "one").unwrap();
        assert_eq!(dir.read("/x").unwrap().1, 0);
        assert_eq!(dir.update("/x", "two").unwrap(), 1);
        let (data, version) = dir.read("/x").unwrap();
        assert_eq!(&data[..], b"two");
        assert_eq!(version, 1);
    }

    #[test]
    fn create_requires_parent() {
        let dir = open_dir();
        assert_eq!(
            dir.create("/a/b", "x"),
            Err(DirectoryError::NoParent {
                path: "/a/b".into()
            })
        );
        dir.ensure_path("/a/b/c").unwrap();
        assert_eq!(
            dir.children("/a/b").unwrap(),
            BTreeSet::from(["c".to_owned()])
        );
    }

    #[test]
    fn data_watch_fires_once() {
        let dir = open_dir();
        dir.create("/x", "v0").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dir.watch_data("/x", tx).unwrap();

        dir.update("/x", "v1").unwrap();
        dir.update("/x", "v2").unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            WatchEvent {
                path: "/x".into(),
                kind: WatchKind::Data
            }
        );
        assert!(rx.try_recv().is_err(), "watch must be one-shot");
        assert_eq!(dir.armed_watches(), 0);
    }

    #[test]
    fn child_watch_fires_on_create_and_delete() {
        let dir = open_dir();
        dir.ensure_path("/ports").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dir.watch_children("/ports", tx.clone()).unwrap();
        dir.create("/ports/p1", "{}").unwrap();
        assert_eq!(rx.try_recv().unwrap().kind, WatchKind::Children);

        dir.watch_children("/ports", tx).unwrap();
        dir.delete("/ports/p1").unwrap();
        assert_eq!(rx.try_recv().unwrap().path, "/ports");
    }

    #[test]
    fn rearming_with_the_same_channel_is_idempotent() {
        let dir = open_dir();
        dir.create("/x", "v0").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        dir.watch_data("/x", tx.clone()).unwrap();
        dir.watch_data("/x", tx).unwrap();
        assert_eq!(dir.armed_watches(), 1);
    }

    #[test]
    fn watches_on_missing_nodes_are_refused() {
        let dir = open_dir();
        dir.create("/x", "v0").unwrap();
        dir.delete("/x").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            dir.watch_data("/x", tx.clone()),
            Err(DirectoryError::NoNode { path: "/x".into() })
        );
        assert!(matches!(
            dir.watch_children("/x", tx),
            Err(DirectoryError::NoNode { .. })
        ));
        assert_eq!(dir.armed_watches(), 0);
    }

    #[test]
    fn delete_refuses_non_empty_nodes() {
        let dir = open_dir();
        dir.ensure_path("/a/b").unwrap();
        assert!(matches!(
            dir.delete("/a"),
            Err(DirectoryError::NotEmpty { .. })
        ));
    }

    #[test]
    fn reads_fail_while_disconnected() {
        let dir = open_dir();
        dir.create("/x", "v").unwrap();
        dir.inject_session_event(SessionEvent::Disconnected);
        assert_eq!(dir.read("/x"), Err(DirectoryError::ConnectionLoss));

        dir.inject_session_event(SessionEvent::Connected);
        assert!(dir.read("/x").is_ok());

        dir.inject_session_event(SessionEvent::Expired);
        assert_eq!(dir.read("/x"), Err(DirectoryError::SessionExpired));
        assert!(dir.open().is_err());
    }

    #[tokio::test]
    async fn session_events_are_broadcast() {
        let dir = MemoryDirectory::new();
        let mut rx = dir.subscribe_session();
        dir.open().unwrap();
        dir.inject_session_event(SessionEvent::Disconnected);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Connected);
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::Disconnected);
    }
}
