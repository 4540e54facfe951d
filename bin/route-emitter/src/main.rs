use anyhow::{Context, Result};
use clap::Parser;
use emitter_core::{
    ClusterEventSource, EventHandler, MessageBus, NatsEmitter, PrometheusMetrics, Syncer, Watcher,
};
use emitter_http::{HttpEventSource, RoutingApiEmitter, SourceConfig};
use emitter_nats::{NatsClient, NatsOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod health;
mod logging;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "route-emitter", version, about = "Announces routes for running instances to the router fleet")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, env = "ROUTE_EMITTER_CONFIG")]
    config: Option<PathBuf>,
}

fn source_config(config: &Config) -> SourceConfig {
    let mut source = SourceConfig::new(config.bbs_address.clone());
    source.ca_cert_file = config.bbs_ca_cert_file.clone();
    source.client_cert_file = config.bbs_client_cert_file.clone();
    source.client_key_file = config.bbs_client_key_file.clone();
    source.timeout = config.communication_timeout;
    source
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    logging::init_logging(&config)?;

    info!(
        cell_id = ?config.cell_id,
        local_mode = config.local_mode,
        sync_interval = ?config.sync_interval,
        "Starting route-emitter..."
    );

    let (username, password) = config.nats_credentials();
    let nats = NatsClient::connect(
        NatsOptions::new(&config.nats_addresses)
            .with_credentials(username, password)
            .with_connect_timeout(config.communication_timeout),
    )
    .await
    .context("connecting to nats")?;
    let nats = Arc::new(nats);
    info!(server = nats.server(), "Connected to nats");
    let bus: Arc<dyn MessageBus> = nats.clone();

    let metrics = Arc::new(PrometheusMetrics::new().context("creating metrics")?);

    let mut handler = EventHandler::new()
        .with_registry_emitter(Arc::new(NatsEmitter::new(bus.clone(), config.route_emitting_workers)))
        .with_metrics(metrics.clone())
        .with_local_mode(config.local_mode);

    match &config.routing_api {
        Some(routing_api) => {
            let emitter = RoutingApiEmitter::new(
                &routing_api.uri,
                routing_api.port,
                config.communication_timeout,
            )
            .context("creating routing api emitter")?;
            handler = handler.with_tcp_emitter(Arc::new(emitter));
            info!(uri = %routing_api.uri, port = routing_api.port, "TCP route emitting enabled");
        }
        None => warn!("routing_api not configured, TCP routes will not be emitted"),
    }

    let source: Arc<dyn ClusterEventSource> = Arc::new(
        HttpEventSource::new(&source_config(&config)).context("creating cluster event source")?,
    );

    let (syncer, events) = Syncer::new(bus, config.sync_interval);
    let watcher = Watcher::new(handler, source, events).with_cell_id(config.cell_id.clone());

    let cancel = CancellationToken::new();

    let listener = TcpListener::bind(config.healthcheck_address()?)
        .await
        .with_context(|| format!("binding {}", config.healthcheck_address))?;
    let health = tokio::spawn(health::serve(listener, metrics, cancel.clone()));

    let mut syncer = tokio::spawn(syncer.run(cancel.clone()));
    let mut watcher = tokio::spawn(watcher.run(cancel.clone()));

    let mut abnormal = false;
    let mut syncer_result = None;
    let mut watcher_result = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for shutdown signal")?;
            info!("Shutdown signal received, exiting...");
        }
        _ = nats.closed() => {
            error!("Lost nats connection, exiting...");
            abnormal = true;
        }
        result = &mut syncer => syncer_result = Some(result),
        result = &mut watcher => watcher_result = Some(result),
    }
    cancel.cancel();

    let syncer_result = match syncer_result {
        Some(result) => result,
        None => syncer.await,
    };
    let watcher_result = match watcher_result {
        Some(result) => result,
        None => watcher.await,
    };
    abnormal |= report("syncer", syncer_result);
    abnormal |= report("watcher", watcher_result);

    match health.await {
        Ok(Err(e)) => warn!(error = %e, "Health listener failed"),
        Err(e) => warn!(error = %e, "Health listener panicked"),
        Ok(Ok(())) => {}
    }
    nats.close();

    if abnormal {
        anyhow::bail!("route-emitter stopped abnormally");
    }
    info!("route-emitter stopped");
    Ok(())
}

/// Log how a task ended; true when it failed
fn report(task: &str, result: std::result::Result<emitter_core::Result<()>, JoinError>) -> bool {
    match result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(task, error = %e, "Task failed");
            true
        }
        Err(e) => {
            error!(task, error = %e, "Task panicked");
            true
        }
    }
}
