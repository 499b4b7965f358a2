//! Query CLI - Exercise request coalescing, stream fan-out and the query cache.
//!
//! Commands:
//! - `tq simulate` - Concurrent views over a coalescing link and the query cache
//! - `tq timeline` - Watch entries go stale and expire, pinned and unpinned
//! - `tq replicate` - Fan one stream out to several consumers
//! - `tq config` - Manage configuration

mod commands;
mod config;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use commands::{ConfigArgs, ReplicateArgs, SimulateArgs, TimelineArgs};

/// Query CLI - Coalesce, replicate and cache RPC results
#[derive(Parser)]
#[command(name = "tq")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use JSON output format
    #[arg(long, global = true)]
    json: bool,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent views against an in-memory procedure
    Simulate(SimulateArgs),

    /// Show cache freshness over time
    Timeline(TimelineArgs),

    /// Replicate a stream to several consumers
    Replicate(ReplicateArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    });
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = output::Output::new(cli.verbose, cli.json);
    let ctx = context::Context::load(cli.config.as_deref(), output)?;

    let result = match cli.command {
        Commands::Simulate(args) => commands::simulate::run(args, &ctx).await,
        Commands::Timeline(args) => commands::timeline::run(args, &ctx).await,
        Commands::Replicate(args) => commands::replicate::run(args, &ctx).await,
        Commands::Config(args) => commands::config::run(args, &ctx).await,
    };

    if let Err(e) = result {
        ctx.output.error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
