//! Gateway view aggregator
//!
//! Fans per-network change topics into the unified gateway update topic.

use clap::Parser;
use gwview_aggregator::Aggregator;
use gwview_core::{TopicPattern, ViewSyncConfig};
use gwview_transport::{JetStreamSink, JetStreamSinkConfig, JetStreamSource, JetStreamSourceConfig};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gwview-aggregator")]
#[command(about = "Aggregates gateway change topics into one ordered update stream")]
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

    info!(version = env!("CARGO_PKG_VERSION"), "Starting gwview-aggregator");

    let source = JetStreamSource::new(JetStreamSourceConfig::for_changes(&config));
    let sink = JetStreamSink::new(JetStreamSinkConfig::for_unified(&config));
    let aggregator = Arc::new(Aggregator::new(
        source,
        sink,
        TopicPattern::new(&config.aggregator.topic_prefix),
        &config.unified.topic,
    ));

    let stopper = aggregator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            stopper.stop();
        }
    });

    if let Err(e) = aggregator.run().await {
        error!(error = %e, "Aggregator failed");
        return Err(e.into());
    }

    info!("Aggregator stopped gracefully");
    Ok(())
}
