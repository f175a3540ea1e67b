#![allow(dead_code)]

//! Process bootstrap & CLI (§9-A): `run` (start every configured provider
//! and block until ctrl-c), `fetch-once` (bootstrap one provider and print
//! its composed outbound list), and `validate` (parse configuration only).
//!
//! `management` and `scripttest` are library-surface modules a host process
//! wires in on its own terms (§1 Non-goal: no bound listener here), so this
//! binary only uses them transitively through `provider`.

mod cache;
mod core;
mod filter;
mod management;
mod parsers;
mod provider;
mod request;
mod scripttest;

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::core::config::AppConfig;
use crate::provider::Provider;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap and run every configured provider until interrupted.
    Run,
    /// Bootstrap a single provider and print its composed outbound list.
    FetchOnce {
        /// The provider's `tag`, as given in config.toml.
        #[arg(short, long)]
        tag: String,
    },
    /// Parse and validate configuration without performing any network I/O.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;

    match cli.command {
        Commands::Validate => {
            tracing::info!(providers = config.providers.len(), "configuration is valid");
        }

        Commands::FetchOnce { tag } => {
            let provider_config = config
                .providers
                .into_iter()
                .find(|p| p.tag == tag)
                .ok_or_else(|| anyhow::anyhow!("no provider configured with tag '{tag}'"))?;
            let provider = Provider::new(provider_config)?;
            let outbounds = provider.start_get_outbounds().await?;
            println!("{}", serde_json::to_string_pretty(&outbounds)?);
        }

        Commands::Run => {
            let mut providers: HashMap<String, Arc<Provider>> = HashMap::new();
            for provider_config in config.providers {
                let tag = provider_config.tag.clone();
                let provider = Arc::new(Provider::new(provider_config)?);
                if let Err(err) = provider.start_get_outbounds().await {
                    tracing::error!(tag = %tag, %err, "provider bootstrap failed");
                    continue;
                }
                provider.start().await?;
                providers.insert(tag, provider);
            }

            tracing::info!(count = providers.len(), "all providers bootstrapped, running");

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown signal received, closing providers");

            for provider in providers.values() {
                provider.close().await;
            }
        }
    }

    Ok(())
}
