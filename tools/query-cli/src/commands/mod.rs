//! CLI command implementations.

pub mod config;
pub mod replicate;
pub mod simulate;
pub mod timeline;

use clap::{Args, Subcommand};
use serde_json::Value;
use turbo_rpc::{Method, Procedure};

/// The in-memory procedure every simulation calls.
pub struct ListItems;

impl Procedure for ListItems {
    type Input = Option<u32>;
    type Output = Value;
    const PATH: &'static str = "item.list";
    const METHOD: Method = Method::Get;
}

/// Arguments for the simulate command.
#[derive(Args)]
pub struct SimulateArgs {
    /// Views requesting the same list.
    #[arg(long)]
    pub views: Option<usize>,

    /// Views requesting a different page each.
    #[arg(long)]
    pub distinct: Option<usize>,

    /// Simulated upstream latency in milliseconds.
    #[arg(long)]
    pub latency_ms: Option<u64>,

    /// Skip the query cache phase.
    #[arg(long)]
    pub no_cache: bool,
}

/// Arguments for the timeline command.
#[derive(Args)]
pub struct TimelineArgs {
    /// Age after which entries are stale.
    #[arg(long, default_value = "100")]
    pub stale_ms: u64,

    /// Age after which unpinned entries are evicted.
    #[arg(long, default_value = "1000")]
    pub evict_ms: u64,
}

/// Arguments for the replicate command.
#[derive(Args)]
pub struct ReplicateArgs {
    /// Number of consumers.
    #[arg(short, long, default_value = "3")]
    pub replicas: usize,

    /// Items emitted by the source.
    #[arg(short, long, default_value = "5")]
    pub items: u64,

    /// Stop the first consumer after this many items.
    #[arg(long)]
    pub stop_after: Option<usize>,

    /// Per-consumer buffer; defaults to the dedupe config.
    #[arg(long)]
    pub capacity: Option<usize>,
}

/// Arguments for the config command.
#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration.
    Show,
    /// Get a config value.
    Get {
        /// Config key (dot-separated).
        key: String,
    },
    /// Set a config value.
    Set {
        /// Config key (dot-separated).
        key: String,
        /// Value to set.
        value: String,
    },
    /// Initialize a new config file.
    Init {
        /// Overwrite an existing config without asking.
        #[arg(short, long)]
        force: bool,
    },
    /// Validate the config file.
    Validate,
}
