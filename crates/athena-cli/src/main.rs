//! CLI binary for running and validating Athena pipelines.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use athena_components::default_registry;
use athena_runtime::{Engine, RuntimeConfig};
use athena_types::Properties;

#[derive(Parser)]
#[command(name = "athena", version, about = "Pluggable streaming pipeline runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline until a shutdown signal or until every source is exhausted
    Run {
        /// Path to the pipeline JSON configuration
        config: PathBuf,
    },

    /// Build a pipeline without opening anything and print its topology
    Validate {
        /// Path to the pipeline JSON configuration
        config: PathBuf,
    },

    /// List the registered component types and their properties
    Inventory {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let properties = load_config(&config)?;
            init_tracing(cli.verbose, Some(&properties));
            tracing::info!(config = %config.display(), "Loaded pipeline configuration");
            cmd_run(properties).await?;
        }
        Commands::Validate { config } => {
            let properties = load_config(&config)?;
            init_tracing(cli.verbose, Some(&properties));
            cmd_validate(properties)?;
        }
        Commands::Inventory { json } => {
            init_tracing(cli.verbose, None);
            cmd_inventory(json)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Properties> {
    Properties::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

/// `RUST_LOG` wins, then `--verbose`, then the pipeline's `log-level`.
fn init_tracing(verbose: bool, properties: Option<&Properties>) {
    let default_level = if verbose {
        "debug".to_string()
    } else {
        properties
            .and_then(|p| RuntimeConfig::from_properties(p).ok())
            .map(|c| c.log_level)
            .unwrap_or_else(|| "info".to_string())
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn cmd_run(properties: Properties) -> anyhow::Result<()> {
    let engine = Engine::new(default_registry(), properties);
    engine.run().await?;
    Ok(())
}

fn cmd_validate(properties: Properties) -> anyhow::Result<()> {
    let engine = Engine::new(default_registry(), properties);
    let pipeline = engine.build()?;

    println!("Pipeline is valid");
    println!("Mode: {}", pipeline.config().mode);
    println!("State dir: {}", pipeline.config().state_dir.display());
    println!("\nTasks:");
    for name in pipeline.task_names() {
        println!("  {name}");
    }
    println!("\nEdges:");
    print!("{}", pipeline.topology());
    Ok(())
}

fn cmd_inventory(json: bool) -> anyhow::Result<()> {
    let definitions = default_registry().definitions();
    if json {
        println!("{}", serde_json::to_string_pretty(&definitions)?);
        return Ok(());
    }

    for def in &definitions {
        println!("{}.{}", def.role, def.type_name);
        for prop in &def.properties {
            let default = match &prop.default {
                Some(value) => format!("default {value}"),
                None => "required".to_string(),
            };
            println!(
                "  {:<14} {:<12} {:<16} {}",
                prop.name,
                prop.kind.as_str(),
                default,
                prop.description
            );
        }
    }
    Ok(())
}
