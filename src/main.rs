use clap::{Parser, Subcommand};
use logharvest::api::{CachedFleetApi, FleetApi, RdsFleetApi};
use logharvest::bus::{KafkaWorkSource, LogType, WorkItemProducer};
use logharvest::config::{DiscoveryConfig, ProcessorConfig};
use logharvest::discovery::Discovery;
use logharvest::limit::RateLimiter;
use logharvest::metrics::Metrics;
use logharvest::processor::{ForwardSink, HttpSink, Processor, Sink};
use logharvest::store::{
    dynamo_client, DynamoCheckpointStore, DynamoDlqStore, DynamoInstanceRegistry,
    DynamoTrackingStore,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logharvest")]
#[command(about = "Database fleet log harvesting pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep the fleet and enqueue log files that need processing
    Discovery,
    /// Consume enqueued log files, parse them, and ship them to the sink
    Processor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Health probe short-circuits before argument parsing.
    if std::env::args().nth(1).as_deref() == Some("-health") {
        println!("OK");
        return Ok(());
    }

    let default_filter = match std::env::var("LOG_LEVEL").ok().as_deref() {
        Some("DEBUG") | Some("debug") => "logharvest=debug",
        _ => "logharvest=info",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Commands::Discovery => run_discovery(cancel).await?,
        Commands::Processor => run_processor(cancel).await?,
    }

    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_discovery(cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = DiscoveryConfig::from_env();
    info!(
        shard_id = config.shard_id,
        total_shards = config.total_shards,
        "starting discovery service"
    );

    let dynamo = dynamo_client(&config.region).await;
    let live_api: Arc<dyn FleetApi> = Arc::new(RdsFleetApi::new(&config.region).await);
    let cache = match &config.valkey_url {
        Some(url) => CachedFleetApi::connect(url).await,
        None => None,
    };
    let api: Arc<dyn FleetApi> = Arc::new(CachedFleetApi::new(live_api, cache, config.cache_ttls));

    let tracking = Arc::new(DynamoTrackingStore::new(
        dynamo.clone(),
        config.tracking_table.clone(),
    ));
    let registry = Arc::new(DynamoInstanceRegistry::new(
        dynamo,
        config.instance_table.clone(),
    ));
    let publisher = Arc::new(WorkItemProducer::new(&config.kafka_brokers)?);
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_sec,
        config.rate_limit_per_sec,
    ));
    let metrics = Arc::new(Metrics::new());

    let discovery = Discovery::new(config, api, tracking, registry, publisher, limiter, metrics);
    discovery.run(cancel).await;
    Ok(())
}

async fn run_processor(cancel: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = ProcessorConfig::from_env();

    let dynamo = dynamo_client(&config.region).await;
    let api: Arc<dyn FleetApi> = Arc::new(RdsFleetApi::new(&config.region).await);
    let tracking = Arc::new(DynamoTrackingStore::new(
        dynamo.clone(),
        config.tracking_table.clone(),
    ));
    let checkpoints = Arc::new(DynamoCheckpointStore::new(
        dynamo.clone(),
        config.checkpoint_table.clone(),
    ));
    let dlq = Arc::new(DynamoDlqStore::new(dynamo, config.dlq_table.clone()));

    let topics = [LogType::Error.topic(), LogType::Slowquery.topic()];
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    let source = Arc::new(KafkaWorkSource::new(
        &config.kafka_brokers,
        &config.consumer_group,
        &topic_refs,
    )?);

    let sink: Arc<dyn Sink> = if config.sink.forward_enabled {
        info!(
            host = %config.sink.forward_host,
            port = config.sink.forward_port,
            "log forwarding enabled"
        );
        Arc::new(ForwardSink::new(
            &config.sink.forward_host,
            config.sink.forward_port,
        ))
    } else {
        info!("using http log store sink");
        Arc::new(HttpSink::new(
            &config.sink,
            config.connection_pool_size,
            config.connection_timeout,
        )?)
    };
    let metrics = Arc::new(Metrics::new());

    let processor = Arc::new(Processor::new(
        config,
        api,
        tracking,
        checkpoints,
        dlq,
        source,
        sink,
        metrics,
    ));
    processor.run(cancel).await;
    Ok(())
}
