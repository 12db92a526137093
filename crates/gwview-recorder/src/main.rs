//! Gateway view recorder
//!
//! Applies the unified gateway update topic to the configured view store.

use clap::Parser;
use gwview_core::{ConfigRegistry, ViewSyncConfig};
use gwview_recorder::{Recorder, UpdateApplier};
use gwview_storage::{build_store, http_services};
use gwview_transport::{JetStreamSource, JetStreamSourceConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gwview-recorder")]
#[command(about = "Applies unified gateway updates to the view store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "GWVIEW_CONFIG")]
    config: Option<String>,

    /// NATS server URL (overrides the configuration file)
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// Log level (overrides the configuration file)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ViewSyncConfig::load(args.config.as_deref())?;
    if let Some(url) = args.nats_url {
        config.broker.url = url;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    config.validate()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    if config.observability.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting gwview-recorder");

    let (configurations, statuses) = http_services(&config.services)?;
    let registry = Arc::new(ConfigRegistry::from_specs(
        &config.config_types,
        configurations.clone(),
    )?);
    let store = build_store(&config, registry.clone(), configurations, statuses).await?;
    store.init_tables().await?;

    let applier = UpdateApplier::new(
        store,
        registry,
        config.recorder.retired_config_types.clone(),
    );
    let source = JetStreamSource::new(JetStreamSourceConfig::for_unified(&config));
    let recorder = Arc::new(Recorder::new(source, applier));

    let stopper = recorder.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stopper.stop();
        }
    });

    if let Err(e) = recorder.run().await {
        error!(error = %e, "Recorder failed");
        return Err(e.into());
    }

    info!("Recorder stopped gracefully");
    Ok(())
}
