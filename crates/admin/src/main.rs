//! `checkpoint-admin`: operator CLI for the signing key slot.
//!
//! ```bash
//! checkpoint-admin --config checkpoint.toml status
//! checkpoint-admin --config checkpoint.toml execute --dry-run
//! checkpoint-admin --config checkpoint.toml execute
//! checkpoint-admin --config checkpoint.toml verify
//! ```

mod cli;

use anyhow::anyhow;
use checkpoint_authn::{CredentialVerifier, RotationAdmin};
use checkpoint_core::SharedStore;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

fn init_tracing(filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(filter).map_err(|e| anyhow!("invalid log filter: {e}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = cli::load_config(cli.config.as_deref())?;
    let store = SharedStore::connect(&config.store).await;
    if !store.is_distributed() {
        tracing::warn!("operating on an in-process store; changes are lost on exit");
    }

    let admin = RotationAdmin::new(CredentialVerifier::new(store, config.credentials.clone()));
    let outcome = cli::run(&admin, &cli.actor, &cli.command, cli.json).await?;
    println!("{}", outcome.output);

    if !outcome.success {
        anyhow::bail!("signing key slot failed verification");
    }
    Ok(())
}
