//! `check-config`: print the configuration the agent would run with.

use std::fmt::Write;

use humantime::format_duration;
use vrn_core::AgentConfig;

use crate::cli::{CheckConfigArgs, GlobalOpts};
use crate::commands::{config_file, load_config, load_seed};
use crate::error::AgentError;

pub fn handle(args: &CheckConfigArgs, global: &GlobalOpts) -> Result<(), AgentError> {
    let path = config_file(global);
    let agent = load_config(global)?
        .into_agent_config()
        .map_err(|source| AgentError::Config {
            path: path.display().to_string(),
            source,
        })?;

    let mut out = render(&agent, &path.display().to_string(), path.exists());
    if let Some(topology) = &args.topology {
        let seed = load_seed(topology)?;
        let _ = writeln!(
            out,
            "topology            {} ({} entities)",
            topology.display(),
            seed.entities().count()
        );
    }
    print!("{out}");
    Ok(())
}

fn render(agent: &AgentConfig, path: &str, found: bool) -> String {
    let source = if found { path.to_owned() } else { format!("{path} (not found, defaults)") };
    let sw = &agent.switch;
    let mut out = String::new();
    let _ = writeln!(out, "config              {source}");
    let _ = writeln!(out, "host_id             {}", agent.host_id);
    let _ = writeln!(out, "disconnected_grace  {}", format_duration(agent.disconnected_grace));
    let _ = writeln!(out, "dynamic_routing     {}", agent.enable_dynamic_routing);
    let _ = writeln!(out, "external_id_key     {}", agent.external_id_key);
    let _ = writeln!(out, "store.hosts         {}", agent.store.hosts);
    let _ = writeln!(out, "store.session       {}", format_duration(agent.store.session_timeout));
    let _ = writeln!(out, "store.root_path     {}", agent.store.root_path);
    let _ = writeln!(out, "switch.listen_addr  {}", sw.listen_addr);
    let _ = writeln!(out, "switch.flow_idle    {}", format_duration(sw.flow_idle_timeout));
    let _ = writeln!(out, "switch.mac_idle     {}", format_duration(sw.mac_idle_timeout));
    let _ = writeln!(out, "switch.arp_timeout  {}", format_duration(sw.arp_timeout));
    let _ = writeln!(out, "switch.arp_ttl      {}", format_duration(sw.arp_entry_ttl));
    let _ = writeln!(out, "switch.max_pending  {}", sw.max_pending_per_target);
    out
}
