//! NodeSet controller
//!
//! Watches NodeSets, their pods and revisions, and the cluster nodes, and
//! drives each NodeSet toward its desired fleet through the object store
//! and the Slurm REST API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use slinky_nodeset_controller::{
    config::Config,
    events::KubeEventRecorder,
    nodeset::{EventHandler, NodeSetReconciler},
    slurm::{rest::RestClient, ClientMap},
    slurmcontrol::RealSlurmControl,
    store::kube::{KubeClient, KubeStore},
    store::ObjectStore,
    worker::{NodeSetWorker, WorkQueue},
};
use slinky_reconcile::Expectations;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn read_token(path: &std::path::Path) -> Result<String> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("reading token file {}", path.display()))?;
    Ok(token.trim().to_string())
}

fn slurm_clients(config: &Config) -> Result<ClientMap> {
    let clients = ClientMap::new();
    for cluster in &config.slurm_clusters {
        let token = match &cluster.token_file {
            Some(path) => read_token(path)?,
            None => String::new(),
        };
        let client = RestClient::new(&cluster.url, token)
            .with_context(|| format!("slurm client for {}", cluster.controller))?;
        info!(controller = %cluster.controller, url = %cluster.url, "Registered Slurm cluster");
        clients.add(cluster.controller.clone(), Arc::new(client));
    }
    Ok(clients)
}

fn every(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: impl Fn() -> futures_util::future::BoxFuture<'static, ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // prefer RUST_LOG, fall back to NODESET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting NodeSet controller");
    info!(
        api = %config.kube_api_url,
        namespace = %config.namespace,
        workers = config.workers,
        clusters = config.slurm_clusters.len(),
        "Configuration loaded"
    );

    let token = config.kube_token_file.as_deref().map(read_token).transpose()?;
    let ca = config
        .kube_ca_file
        .as_deref()
        .map(std::fs::read)
        .transpose()
        .context("reading CA file")?;
    let client = KubeClient::new(&config.kube_api_url, token, ca.as_deref())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let kube = Arc::new(KubeStore::new(client.clone()));
    let store: Arc<dyn ObjectStore> = kube.clone();
    let recorder = Arc::new(KubeEventRecorder::new(client, "nodeset-controller"));
    let slurm = Arc::new(RealSlurmControl::new(Arc::new(slurm_clients(&config)?)));
    let expectations = Arc::new(Expectations::new(config.expectations_ttl));

    let reconciler = Arc::new(
        NodeSetReconciler::new(Arc::clone(&store), slurm, recorder)
            .with_expectations(Arc::clone(&expectations)),
    );
    let queue = Arc::new(WorkQueue::new());
    let handler = Arc::new(EventHandler::new(
        Arc::clone(&store),
        expectations,
        Arc::clone(&queue),
    ));

    let mut handles = Vec::new();
    handles.extend(Arc::clone(&handler).spawn(shutdown_rx.clone()));
    handles.extend(kube.spawn_watchers(&config.namespace, config.poll_interval, shutdown_rx.clone()));

    let worker = Arc::new(NodeSetWorker::new(Arc::clone(&reconciler), Arc::clone(&queue)));
    handles.extend(Arc::clone(&worker).spawn(config.workers, shutdown_rx.clone()));

    handles.push(every(config.resync_interval, shutdown_rx.clone(), {
        let handler = Arc::clone(&handler);
        move || {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler.resync_all().await })
        }
    }));
    handles.push(every(config.backoff_gc_interval, shutdown_rx, {
        let reconciler = Arc::clone(&reconciler);
        let worker = Arc::clone(&worker);
        move || {
            let reconciler = Arc::clone(&reconciler);
            let worker = Arc::clone(&worker);
            Box::pin(async move {
                reconciler.backoff().gc(std::time::Instant::now());
                worker.gc();
            })
        }
    }));

    handler.resync_all().await;

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);
    queue.shutdown();

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for handle in handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Task did not shut down in time");
        }
    }

    info!("NodeSet controller shutdown complete");
    Ok(())
}
