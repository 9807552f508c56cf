use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use user_sync_cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(cli.log_filter())
        .or_else(|_| EnvFilter::try_new("warn"))
        .map_err(|err| anyhow!("invalid log filter: {err}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;

    run_cli(cli)
}
