//! Ephemeral storage exporter
//!
//! Runs either as a DaemonSet scraping the local kubelet or as a single
//! Deployment scraping every node, and exposes ephemeral storage usage of
//! nodes, pods and containers as Prometheus gauges.

use anyhow::{anyhow, Context, Result};
use exporter_lib::{
    cluster::{ClusterApi, KubeCluster},
    compute::StatsProcessor,
    gc::GarbageCollector,
    health::{components, HealthRegistry},
    nodes::NodeTracker,
    observability::{StorageMetrics, StructuredLogger},
    pods::PodResourceCache,
    scheduler::ScrapeSchedulerBuilder,
    stats::{ClusterStatsSource, KubeletClient, NodeStatsQuery, RetryPolicy, StatsSource},
};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::ExporterConfig::load()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(fmt::layer().json())
        .init();

    let mode = config.deploy_mode()?;
    let features = config.features();
    let logger = StructuredLogger::new("exporter");
    logger.log_startup(EXPORTER_VERSION, mode.as_str(), &features);

    let health = HealthRegistry::with_components(components::ALL).await;
    let metrics = Arc::new(
        StorageMetrics::new(Registry::new(), features).context("Failed to register gauges")?,
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to build Kubernetes client")?;
    let cluster = Arc::new(KubeCluster::new(client.clone()));
    let cluster_api: Arc<dyn ClusterApi> = cluster.clone();

    let tracker = Arc::new(NodeTracker::new(config.tracker_config()?, metrics.clone()));
    let cache = features
        .tracks_pods()
        .then(|| Arc::new(PodResourceCache::new(config.profile_options(), metrics.clone())));

    // Watch tasks only return when their stream ends, which is fatal.
    let mut watches: JoinSet<(&'static str, Result<()>)> = JoinSet::new();
    {
        let tracker = tracker.clone();
        let cluster_api = cluster_api.clone();
        if mode.is_cluster_wide() {
            let nodes = cluster.nodes();
            watches.spawn(async move {
                tracker.initialize(cluster_api.as_ref()).await;
                (components::NODE_TRACKER, tracker.watch(nodes).await)
            });
        } else {
            tokio::spawn(async move { tracker.initialize(cluster_api.as_ref()).await });
        }
    }
    if let Some(cache) = cache.clone() {
        let cluster_api = cluster_api.clone();
        let pods = cluster.pods();
        watches.spawn(async move {
            cache.initialize(cluster_api.as_ref()).await;
            (components::POD_CACHE, cache.watch(pods).await)
        });
    }

    let kubelet = if config.scrape_from_kubelet {
        Some(KubeletClient::new(config.kubelet_config()).await?)
    } else {
        None
    };
    let source: Arc<dyn StatsSource> = Arc::new(ClusterStatsSource::new(client, kubelet));
    let query = Arc::new(NodeStatsQuery::new(
        source,
        RetryPolicy::for_interval(config.interval()),
    ));

    let mut builder = ScrapeSchedulerBuilder::new()
        .tracker(tracker.clone())
        .cluster(cluster_api.clone())
        .query(query)
        .processor(Arc::new(StatsProcessor::new(metrics.clone(), cache.clone())))
        .health(health.clone())
        .config(config.scheduler_config())
        .wait_for(tracker.ready_signal());
    if features.needs_pod_profiles() {
        if let Some(cache) = &cache {
            builder = builder.wait_for(cache.ready_signal());
        }
    }
    let scheduler = builder.build()?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let gc_handles = if config.gc_enabled {
        GarbageCollector::new(cluster_api, tracker, cache, health.clone(), config.gc_config())
            .spawn(&shutdown_tx)
    } else {
        Vec::new()
    };

    let app_state = Arc::new(api::AppState::new(health.clone(), metrics));
    let mut api_handle = tokio::spawn(api::serve(config.metrics_port, app_state));

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for SIGINT")?;
            logger.log_shutdown("SIGINT received");
            Ok(())
        }
        Some(joined) = watches.join_next() => {
            let (component, outcome) = joined.context("Watch task panicked")?;
            health.set_unhealthy(component, "Watch stream terminated").await;
            let err = outcome
                .err()
                .unwrap_or_else(|| anyhow!("{} watch ended", component));
            error!(component = component, error = %err, "Watch stream terminated, exiting");
            logger.log_shutdown("watch stream terminated");
            Err(err)
        }
        served = &mut api_handle => {
            let err = match served {
                Ok(Ok(())) => anyhow!("Metrics server stopped"),
                Ok(Err(e)) => e.context("Metrics server failed"),
                Err(e) => anyhow!(e).context("Metrics server panicked"),
            };
            logger.log_shutdown("metrics server stopped");
            Err(err)
        }
    };

    // Receivers may already be gone if their loops ended.
    let _ = shutdown_tx.send(());
    let _ = scheduler_handle.await;
    for handle in gc_handles {
        let _ = handle.await;
    }
    watches.abort_all();
    api_handle.abort();
    info!("Shutdown complete");

    result
}
