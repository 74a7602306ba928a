// ── Topology store glue ──
//
// Directory layout, immutable snapshots, the watch-driven cache that
// keeps them current, and the standalone seed loader.

mod cache;
mod paths;
mod seed;
mod snapshot;

pub use cache::{TopologyCache, TopologyChange};
pub use paths::{PathTarget, TopologyPaths};
pub use seed::TopologySeed;
pub use snapshot::TopologySnapshot;
