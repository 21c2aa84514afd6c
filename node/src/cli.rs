//! # CLI Interface
//!
//! Defines the command-line argument structure for `bazaar-node` using
//! `clap` derive. Supports three subcommands: `run`, `init` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bazaar_protocol::config::{DEFAULT_METRICS_PORT, DEFAULT_P2P_PORT};

/// Bazaar exchange node.
///
/// Publishes this node's offers to its peers, keeps a book of everyone
/// else's, and runs the trade protocol for offers it makes or takes.
#[derive(Parser, Debug)]
#[command(
    name = "bazaar-node",
    about = "Bazaar peer-to-peer exchange node",
    version,
    propagate_version = true
)]
pub struct BazaarNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the data directory, a default configuration file and a fresh
    /// node key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand. Values given here override the
/// configuration file.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    ///
    /// When omitted, the node looks for `config.toml` in the data directory.
    #[arg(long, short = 'c', env = "BAZAAR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Node data directory holding the store and the node key.
    #[arg(long, short = 'd', env = "BAZAAR_DATA_DIR", default_value = ".bazaar")]
    pub data_dir: PathBuf,

    /// Port for peer-to-peer connections.
    #[arg(long, env = "BAZAAR_P2P_PORT")]
    pub p2p_port: Option<u16>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "BAZAAR_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Host name or IP other peers use to reach this node.
    #[arg(long, env = "BAZAAR_ADVERTISED_HOST")]
    pub advertised_host: Option<String>,

    /// Seed node to dial on startup, as `host:port`. May be repeated.
    #[arg(long = "seed", env = "BAZAAR_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// Starting balance of the development wallet, in satoshis.
    #[arg(long, env = "BAZAAR_DEV_BALANCE")]
    pub dev_balance: Option<u64>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "BAZAAR_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "BAZAAR_DATA_DIR", default_value = ".bazaar")]
    pub data_dir: PathBuf,

    /// P2P port written into the generated configuration.
    #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
    pub p2p_port: u16,

    /// Metrics port written into the generated configuration.
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Overwrite an existing node key.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        BazaarNodeCli::command().debug_assert();
    }

    #[test]
    fn seeds_accept_commas_and_repeats() {
        let cli = BazaarNodeCli::parse_from([
            "bazaar-node",
            "run",
            "--seed",
            "10.0.0.1:9860,10.0.0.2:9860",
            "--seed",
            "10.0.0.3:9860",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.seeds.len(), 3);
        assert_eq!(args.p2p_port, None);
    }
}
