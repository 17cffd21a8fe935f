//! pinnet
//!
//! An OCI runtime hook that attaches container network interfaces via
//! CNI plugins and, in fixed-IP mode, replays recorded interface state
//! across container restarts.

mod cli;
mod cni;
mod commands;
mod config;
mod error;
mod logging;
mod netlink;
mod netns;
mod network;
mod oci;
mod result;
mod store;

use clap::Parser;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Oci(args) => commands::oci::run(args),
        Commands::Clean(args) => commands::clean::run(args),
    };

    if let Err(e) = result {
        // once stdio is redirected this line lands in the CNI log;
        // before that, the engine captures it from the hook's stderr
        eprintln!("[hook] failed to proceed: {}", e.chain());
        std::process::exit(e.code() as i32);
    }
}
