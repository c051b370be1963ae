//! devspace CLI.
//!
//! Builds, deploys and attaches to a development environment running in
//! Kubernetes.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use devspace::commands::up::UpCommand;
use devspace::{logging, ui};

/// devspace - develop inside Kubernetes.
#[derive(Parser)]
#[command(
    name = "devspace",
    version,
    about = "Develop inside Kubernetes",
    long_about = "Starts and connects your DevSpace:\n\n\
                  1. Builds your images (if a Dockerfile has changed)\n\
                  2. Deploys the Helm chart\n\
                  3. Starts port forwarding and code synchronization\n\
                  4. Enters the container shell"
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory containing .devspace/config.yaml.
    #[arg(long, global = true, default_value = ".", value_name = "DIR")]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Starts your DevSpace.
    Up(UpCommand),
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Up(cmd) => cmd.run(&cli.workdir).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guards = logging::init(&cli.workdir, cli.verbose);

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            1
        }
    };
    drop(guards);

    // The terminal session leaves a blocking stdin read behind; exiting
    // directly keeps it from holding the runtime open.
    std::process::exit(code);
}
