use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod driver;
mod ledger;
mod node;
mod wire;

use cli::{Cli, Commands};
use config::{cluster_config_path, generate_cluster_configs, generate_sample_config, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_node(config).await?;
        }
        Commands::Init { output } => {
            init_config(output)?;
        }
        Commands::Cluster {
            formulators,
            observers,
            base_port,
            output_dir,
        } => {
            init_cluster(formulators, observers, base_port, output_dir)?;
        }
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
    }

    Ok(())
}

/// Run a PoF node
async fn run_node(config_path: PathBuf) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    let config = if config_path.exists() {
        NodeConfig::load(&config_path)?
    } else {
        error!(
            "Configuration file not found: {:?}. Run 'pof init' to create one.",
            config_path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    };

    let node = Node::new(config)?;
    node.run().await?;

    Ok(())
}

/// Initialize a new configuration file
fn init_config(output: PathBuf) -> Result<()> {
    info!("Generating sample configuration");

    let config = generate_sample_config();
    config.save(&output)?;

    info!("Configuration saved to {:?}", output);

    println!("\nConfiguration file created: {}", output.display());
    println!("Edit the file to customize your node settings.");
    println!("\nTo start the node, run:");
    println!("  pof run --config {}", output.display());

    Ok(())
}

/// Write one configuration per cluster member
fn init_cluster(
    formulators: usize,
    observers: usize,
    base_port: u16,
    output_dir: PathBuf,
) -> Result<()> {
    if formulators == 0 {
        return Err(anyhow::anyhow!("A cluster needs at least one formulator"));
    }
    std::fs::create_dir_all(&output_dir)?;

    let configs = generate_cluster_configs(formulators, observers, base_port);
    println!("Cluster configuration:");
    for config in &configs {
        let path = cluster_config_path(&output_dir, config);
        config.save(&path)?;
        println!(
            "  {:<14} {:<10} {}  {}",
            config.name,
            config.role.to_string(),
            config.listen_addr,
            path.display()
        );
    }

    println!("\nStart each member with:");
    println!("  pof run --config <file>");

    Ok(())
}

/// Generate a new keypair
fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = pof_core::KeyPair::generate();
    let identity = pof_core::Identity::new(keypair.public);

    println!("Generated new keypair:");
    println!("  Address:     {}", identity.address);
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}
