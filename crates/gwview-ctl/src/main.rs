//! Gateway view operational tool
//!
//! Inspects, verifies and repairs materialized gateway views. Commands that
//! take several networks report each network's failure and keep going; the
//! exit status is non-zero if any network failed.

mod commands;

use clap::{Parser, Subcommand};
use gwview_core::prelude::*;
use gwview_storage::{build_store, http_services, ReadOnlyStore};
use gwview_transport::{JetStreamSource, JetStreamSourceConfig};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gwview-ctl")]
#[command(about = "Inspect and repair materialized gateway views")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GWVIEW_CONFIG", global = true)]
    config: Option<String>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "LOG_LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print materialized views as JSON
    Print {
        #[arg(long)]
        network: String,
        /// Restrict to these gateways
        #[arg(long = "gateway")]
        gateways: Vec<String>,
    },
    /// Compare materialized views against the source of truth
    Verify {
        #[arg(long = "network", required = true)]
        networks: Vec<String>,
    },
    /// Delete materialized views
    Delete {
        #[arg(long)]
        network: String,
        #[arg(long = "gateway", required = true)]
        gateways: Vec<String>,
    },
    /// Rebuild views from the source of truth
    Reseed {
        #[arg(long = "network", required = true)]
        networks: Vec<String>,
        /// Offset stamped on the written views; must exceed the offsets the
        /// views already hold
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Replay the unified topic and print updates for one gateway
    Debug {
        #[arg(long)]
        network: String,
        #[arg(long)]
        gateway: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ViewSyncConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    config.validate()?;

    // Output goes to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level)),
        )
        .init();

    let (configurations, statuses) = http_services(&config.services)?;
    let registry = Arc::new(ConfigRegistry::from_specs(
        &config.config_types,
        configurations.clone(),
    )?);

    let open_store = || build_store(&config, registry.clone(), configurations.clone(), statuses.clone());
    let reference = ReadOnlyStore::new(configurations.clone(), statuses.clone(), registry.clone());

    match args.command {
        Command::Print { network, gateways } => {
            let store = open_store().await?;
            let views = commands::print_views(store.as_ref(), &network, &gateways).await?;
            println!("{}", serde_json::to_string_pretty(&views)?);
        }
        Command::Delete { network, gateways } => {
            let store = open_store().await?;
            commands::delete_views(store.as_ref(), &network, &gateways).await?;
        }
        Command::Verify { networks } => {
            let store = open_store().await?;
            let mut failed = 0;
            for network in &networks {
                match commands::verify_network(store.as_ref(), &reference, network).await {
                    Ok(mismatches) => {
                        if !mismatches.is_empty() {
                            warn!(network_id = %network, count = mismatches.len(), "Views out of sync");
                        }
                        let report = json!({ "network_id": network, "mismatches": mismatches });
                        println!("{}", report);
                    }
                    Err(e) => {
                        error!(network_id = %network, error = %e, "Verify failed");
                        failed += 1;
                    }
                }
            }
            finish(networks.len(), failed)?;
        }
        Command::Reseed { networks, offset } => {
            let store = open_store().await?;
            let mut failed = 0;
            for network in &networks {
                match commands::reseed_network(store.as_ref(), &reference, network, offset).await {
                    Ok(report) => {
                        if !report.skipped.is_empty() {
                            warn!(
                                network_id = %network,
                                offset,
                                skipped = ?report.skipped,
                                "Views at or above the reseed offset were not rewritten"
                            );
                        }
                        println!("{}", json!({ "network_id": network, "report": report }));
                    }
                    Err(e) => {
                        error!(network_id = %network, error = %e, "Reseed failed");
                        failed += 1;
                    }
                }
            }
            finish(networks.len(), failed)?;
        }
        Command::Debug { network, gateway } => {
            debug_gateway(&config, &network, &gateway).await?;
        }
    }
    Ok(())
}

async fn debug_gateway(config: &ViewSyncConfig, network: &str, gateway: &str) -> anyhow::Result<()> {
    let source = JetStreamSource::new(JetStreamSourceConfig::for_unified(config).ephemeral());
    source.start().await?;

    let outcome = commands::replay_gateway(&source, network, gateway).await;
    source.stop().await?;

    for (offset, update) in outcome? {
        println!("{}", json!({ "offset": offset, "update": update }));
    }
    Ok(())
}

fn finish(total: usize, failed: usize) -> anyhow::Result<()> {
    info!(total, failed, "Done");
    if failed > 0 {
        anyhow::bail!("{} of {} networks failed", failed, total);
    }
    Ok(())
}
