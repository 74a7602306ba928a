// ── Core error types ──
//
// Lifecycle failures of the agent core. Per-packet outcomes are never
// errors: they surface as `DropReason` data on a verdict.

use std::net::SocketAddr;

use thiserror::Error;
use vrn_proto::DirectoryError;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Switch-control listener ──────────────────────────────────────
    #[error("Cannot listen for switch connections on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    // ── Topology store ───────────────────────────────────────────────
    #[error("Topology store error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Cannot load topology node {path}: {reason}")]
    TopologyLoad { path: String, reason: String },

    #[error("Invalid topology seed: {reason}")]
    Seed { reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}
