//! Cascade CLI - stochastic simulation campaigns, local or distributed.

mod commands;
mod demo;

use clap::Parser;

#[derive(Parser)]
#[command(name = "cascade")]
#[command(about = "Distributed stochastic simulation engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    commands::handle_command(cli.command).await
}
