//! `run`: the agent proper.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vrn_core::{PortServiceRegistry, SessionSupervisor, SupervisorExit, TopologyPaths};
use vrn_proto::MemoryDirectory;

use crate::cli::{GlobalOpts, RunArgs};
use crate::commands::{config_file, load_config, load_seed};
use crate::error::AgentError;

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), AgentError> {
    let agent = load_config(global)?
        .into_agent_config()
        .map_err(|source| AgentError::Config {
            path: config_file(global).display().to_string(),
            source,
        })?;

    // Standalone mode: the directory lives in this process, seeded from
    // the topology file.
    let dir = Arc::new(MemoryDirectory::new());
    let paths = TopologyPaths::new(agent.store.root_path.as_str());
    match &args.topology {
        Some(path) => {
            let seed = load_seed(path)?;
            seed.apply(&dir, &paths).map_err(|source| AgentError::Seed {
                path: path.clone(),
                source,
            })?;
        }
        None => {
            warn!("no topology file given, starting with an empty topology");
            dir.ensure_path(paths.root()).map_err(vrn_core::CoreError::from)?;
        }
    }

    let registry = Arc::new(PortServiceRegistry::new(agent.enable_dynamic_routing));
    let supervisor = SessionSupervisor::new(agent, dir, registry);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received"),
            Err(e) => warn!(error = %e, "cannot listen for interrupts"),
        }
        on_signal.cancel();
    });

    match supervisor.run(shutdown).await? {
        SupervisorExit::Shutdown => Ok(()),
        SupervisorExit::Terminated(reason) => Err(AgentError::SessionLost { reason }),
    }
}
