//! Clap derive structures for the `vrn-agent` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// vrn-agent -- per-host control plane for virtual networks
#[derive(Debug, Parser)]
#[command(
    name = "vrn-agent",
    version,
    about = "Run the per-host virtual network agent",
    long_about = "Answers packet-in requests from the local virtual switch by simulating\n\
        the virtual topology, and installs the resulting flows.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "VRN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the agent and serve switch connections until interrupted
    Run(RunArgs),

    /// Load, validate and print the resolved configuration
    CheckConfig(CheckConfigArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Topology seed (JSON) loaded into the standalone directory
    #[arg(long, short = 't')]
    pub topology: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CheckConfigArgs {
    /// Also validate this topology seed
    #[arg(long, short = 't')]
    pub topology: Option<PathBuf>,
}
