//! netplane CLI
//!
//! Replays orchestrator scenarios against dry-run collaborators and prints
//! the resulting connection status and system effects as JSON.

mod scenario;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netplane::dryrun::{DryRunSystem, Effects};
use netplane::{ConnectionStatus, KeyPair, NetworkerConfig, NetworkerFlags};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::scenario::{Scenario, StepReport};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// netplane - VPN and mesh connection orchestrator simulator
#[derive(Parser)]
#[command(name = "netplane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file, defaults apply when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file
    Run {
        /// Scenario to replay
        scenario: PathBuf,

        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },

    /// Generate a configuration file with default values
    GenConfig {
        #[arg(short, long, default_value = "netplane.toml")]
        output: PathBuf,
    },

    /// Generate a mesh identity key pair
    GenKey,
}

/// Everything printed after a scenario run
#[derive(Serialize)]
struct Report {
    steps: Vec<StepReport>,
    status: ConnectionStatus,
    flags: NetworkerFlags,
    effects: Effects,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run { scenario, pretty } => run(cli.config.as_deref(), &scenario, pretty).await,
        Commands::GenConfig { output } => generate_config(output),
        Commands::GenKey => {
            let keypair = KeyPair::generate();
            println!("private_key = \"{}\"", keypair.private.to_base64());
            println!("public_key = \"{}\"", keypair.public);
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

fn load_config(path: Option<&Path>) -> Result<NetworkerConfig> {
    match path {
        Some(path) => NetworkerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(NetworkerConfig::default()),
    }
}

async fn run(config: Option<&Path>, scenario: &Path, pretty: bool) -> Result<()> {
    let config = load_config(config)?;
    let scenario = Scenario::from_file(scenario)?;
    info!(steps = scenario.steps.len(), "replaying scenario");

    let system = DryRunSystem::new();
    let networker = system.networker(config);

    let steps = scenario::run(&networker, &system, scenario).await;
    let report = Report {
        steps,
        status: networker
            .connection_status()
            .await
            .context("reading connection status")?,
        flags: networker.flags().await,
        effects: system.effects(),
    };

    let json = if pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    let content = toml::to_string_pretty(&NetworkerConfig::default())
        .context("Failed to serialize default config")?;
    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}
