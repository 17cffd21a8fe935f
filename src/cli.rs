//! CLI definition using clap

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// OCI runtime hook bridging container engines to CNI plugins
#[derive(Parser, Debug)]
#[command(name = "pinnet")]
#[command(version)]
#[command(about = "OCI runtime hook with fixed-IP container networking", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a hook invocation for a container lifecycle event
    #[command(about = "Handle an ADD or DEL lifecycle event (OCI state on stdin)")]
    Oci(OciArgs),

    /// Sweep recorded state for containers the engine no longer knows
    #[command(about = "Release CNI resources of removed containers")]
    Clean(CleanArgs),
}

/// Arguments for the oci command
#[derive(Args, Debug)]
pub struct OciArgs {
    /// Path to the hook configuration file
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Lifecycle command, ADD or DEL
    #[arg(long, value_name = "CMD")]
    pub command: String,
}

/// Arguments for the clean command
#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Path to the hook configuration file
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,
}
