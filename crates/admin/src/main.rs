use anyhow::Context;
use clap::Parser;

use eventstore_admin::{Cli, run};
use eventstore_infra::{StoreConfig, connect};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eventstore_observability::init();

    let cli = Cli::parse();

    let config = StoreConfig::from_env().context("invalid event store configuration")?;
    let store = connect(&config).await.context("failed to open event store")?;

    let output = run(store.as_ref(), &cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
