//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for a peercoms node.

use clap::{Parser, Subcommand};

/// peercoms - peer-to-peer group messaging node
///
/// Joins a group of peers, announces the routing keys it handles and
/// dispatches incoming messages to handlers by key.
#[derive(Parser, Debug)]
#[command(name = "peercoms")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a peer node until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "PEERCOMS_CONFIG")]
        config: Option<String>,

        /// Node name shown to peers (defaults to the hostname)
        #[arg(short, long)]
        name: Option<String>,

        /// Group to join
        #[arg(short, long)]
        group: Option<String>,

        /// TCP listen port (0 = auto-assign)
        #[arg(short, long)]
        listen_port: Option<u16>,

        /// Seed peer to dial, as host:port (repeatable)
        #[arg(short, long = "seed")]
        seeds: Vec<String>,

        /// Seconds between peer.status shouts (0 = disabled)
        #[arg(long, default_value = "10")]
        status_interval: u64,
    },

    /// Display version information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
