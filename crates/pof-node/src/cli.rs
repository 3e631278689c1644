use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// PoF - Proof-of-Formulation consensus node
#[derive(Parser)]
#[command(name = "pof")]
#[command(about = "PoF consensus node and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a formulator or observer node
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Initialize a single-formulator configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Generate configurations for a local cluster
    Cluster {
        /// Number of formulators
        #[arg(long, default_value = "3")]
        formulators: usize,

        /// Number of observers
        #[arg(long, default_value = "2")]
        observers: usize,

        /// Listen port of the first member; the rest count up from it
        #[arg(long, default_value = "7000")]
        base_port: u16,

        /// Directory the configuration files are written to
        #[arg(short, long, default_value = "cluster")]
        output_dir: PathBuf,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
