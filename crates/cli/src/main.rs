//! Node resource pinning CLI
//!
//! A command-line tool for inspecting and driving the pinning agent on a
//! node: CPU and device assignments, pod admission and device registration.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{devices, health, pods, state};
use std::path::PathBuf;

/// Node resource pinning CLI
#[derive(Parser)]
#[command(name = "pinctl")]
#[command(author, version, about = "CLI for the node resource pinning agent", long_about = None)]
pub struct Cli {
    /// Agent endpoint URL (can also be set via PINCTL_AGENT_URL env var)
    #[arg(long, env = "PINCTL_AGENT_URL")]
    pub agent_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<output::OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show CPU assignments and device allocations
    State,

    /// Submit a pod for admission
    Admit {
        /// Pod JSON file, `-` for stdin
        #[arg(long, short = 'f')]
        file: PathBuf,
    },

    /// Release every resource held by a pod
    Remove {
        /// Pod UID
        pod_uid: String,
    },

    /// Register the devices of an extended resource
    Register {
        /// Resource name, e.g. vendor.com/gpu
        resource: String,

        /// JSON array of devices, `-` for stdin
        #[arg(long, short = 'f')]
        file: PathBuf,
    },

    /// Show agent component health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let format = config.format(cli.format);
    let client = client::ApiClient::new(&config.agent_url(cli.agent_url))?;

    match cli.command {
        Commands::State => state::show_state(&client, format).await?,
        Commands::Admit { file } => pods::admit(&client, &file, format).await?,
        Commands::Remove { pod_uid } => pods::remove(&client, &pod_uid, format).await?,
        Commands::Register { resource, file } => {
            devices::register(&client, &resource, &file, format).await?
        }
        Commands::Health => health::show_health(&client, format).await?,
    }

    Ok(())
}
