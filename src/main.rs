//! Tachikoma command-line entry point.

use clap::Parser;

use tachikoma::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tachikoma::logging::init(cli.log_json);
    cli::run(cli).await
}
