//! Agent error types with miette diagnostics.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use vrn_config::ConfigError;
use vrn_core::{CoreError, TerminationReason};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const SESSION_LOST: i32 = 4;
}

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    // ── Configuration ────────────────────────────────────────────────

    #[error("Invalid configuration")]
    #[diagnostic(
        code(vrn::config),
        help(
            "Fix the setting named above, or override it with VRN_<SECTION>__<KEY>.\n\
             Config file: {path}"
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("Cannot read topology file {}", path.display())]
    #[diagnostic(code(vrn::topology_file))]
    TopologyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid topology seed in {}", path.display())]
    #[diagnostic(
        code(vrn::topology_seed),
        help("Every port must name an existing device, and every filter an existing chain.")
    )]
    Seed {
        path: PathBuf,
        #[source]
        source: CoreError,
    },

    // ── Runtime ──────────────────────────────────────────────────────

    #[error("Topology store session lost ({reason})")]
    #[diagnostic(
        code(vrn::session_lost),
        help("The agent exits so its supervisor can restart it with a fresh session.")
    )]
    SessionLost { reason: TerminationReason },

    #[error(transparent)]
    #[diagnostic(code(vrn::core))]
    Core(#[from] CoreError),
}

impl AgentError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => exit_code::CONFIG,
            Self::TopologyFile { .. } | Self::Seed { .. } => exit_code::USAGE,
            Self::SessionLost { .. } => exit_code::SESSION_LOST,
            Self::Core(_) => exit_code::GENERAL,
        }
    }
}
