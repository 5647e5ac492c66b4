//! Keystone CLI library

pub mod commands;
pub mod config;
pub mod error;
pub mod lock;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Keystone - bootstrap Kubernetes control-plane nodes
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Also append JSON logs to this file
    #[arg(long, global = true, env = "KEYSTONE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every bootstrap phase against this host
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Print the topology and phase plan without touching anything
    Plan(commands::plan::PlanArgs),
    /// Print quorum and fault tolerance for a member list
    Topology(commands::topology::TopologyArgs),
}

impl Cli {
    /// Run the CLI command and return the process exit code
    pub async fn run(self) -> Result<u8> {
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::Plan(args) => commands::plan::run(args),
            Commands::Topology(args) => commands::topology::run(args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_parse() {
        let cli = Cli::try_parse_from([
            "keystone",
            "--log-file",
            "/tmp/keystone.json",
            "plan",
            "-e",
            "single",
            "-m",
            "10.0.0.1",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Plan(_)));
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/keystone.json")));

        let cli = Cli::try_parse_from([
            "keystone",
            "bootstrap",
            "-e",
            "single",
            "-m",
            "10.0.0.1",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Bootstrap(args) => assert!(args.dry_run),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn members_are_required() {
        assert!(Cli::try_parse_from(["keystone", "topology", "-e", "single"]).is_err());
    }
}
