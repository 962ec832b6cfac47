//! Scrape scheduler
//!
//! Ticks on the sample interval and dispatches one stats query per tracked
//! node into a bounded worker pool. Each worker parses the payload, writes
//! gauges and reports how much of the interval was left.

use crate::cluster::ClusterApi;
use crate::compute::{parse_summary, StatsProcessor};
use crate::health::{components, HealthRegistry};
use crate::models::MonitoredNode;
use crate::nodes::NodeTracker;
use crate::observability::{StorageMetrics, StructuredLogger};
use crate::readiness::{wait_all, ReadySignal};
use crate::stats::{NodeStatsQuery, StatsSource};
use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the scrape scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sample interval (default: 15 seconds)
    pub interval: Duration,
    /// Worker pool size (default: 10)
    pub max_concurrent_queries: usize,
    /// How long to wait for initial population before starting degraded
    pub readiness_timeout: Duration,
    /// Label selector for the monitored-namespace allow-list
    pub namespace_selector: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_concurrent_queries: 10,
            readiness_timeout: Duration::from_secs(30),
            namespace_selector: None,
        }
    }
}

/// Result of one node's scrape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// Gauges written; `remaining_ms` is what was left of the interval
    Recorded { written: usize, remaining_ms: i64 },
    /// Retry budget exhausted; the node's series were evicted
    QueryFailed,
    /// Payload could not be decoded
    ParseFailed,
}

/// Tasks started for one tick
pub struct TickDispatch {
    pub handles: Vec<JoinHandle<ScrapeOutcome>>,
    /// Nodes skipped because the pool was saturated
    pub dropped: usize,
}

type SharedQuery = Arc<NodeStatsQuery<Arc<dyn StatsSource>>>;

/// Everything a worker task needs to scrape one node
#[derive(Clone)]
struct ScrapeWorker {
    query: SharedQuery,
    processor: Arc<StatsProcessor>,
    metrics: Arc<StorageMetrics>,
    interval: Duration,
    logger: StructuredLogger,
}

impl ScrapeWorker {
    async fn scrape(
        &self,
        node: MonitoredNode,
        allowed_namespaces: Option<Arc<HashSet<String>>>,
    ) -> ScrapeOutcome {
        let start = Instant::now();

        let payload = match self.query.query(&node).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node_name = %node.name, error = %e, "Could not query node for ephemeral storage");
                let series = self.metrics.evict_node(&node.name);
                self.logger.log_node_evicted(&node.name, series, "query_failed");
                return ScrapeOutcome::QueryFailed;
            }
        };
        debug!(node_name = %node.name, bytes = payload.len(), "Fetched node stats");

        let summary = match parse_summary(&payload) {
            Ok(summary) => summary,
            Err(e) => {
                error!(node_name = %node.name, error = %e, "Failed to decode node stats");
                return ScrapeOutcome::ParseFailed;
            }
        };

        let outcome = self
            .processor
            .process(&node.name, &summary, allowed_namespaces.as_deref())
            .await;

        let remaining_ms = self.interval.as_millis() as i64 - start.elapsed().as_millis() as i64;
        if remaining_ms <= 0 {
            self.logger
                .log_polling_lag(&node.name, remaining_ms, self.interval.as_secs());
        }
        if self.metrics.features().adjusted_polling_rate {
            self.metrics
                .adjusted_polling_rate
                .set(&[&node.name], remaining_ms as f64);
        }

        ScrapeOutcome::Recorded {
            written: outcome.written,
            remaining_ms,
        }
    }
}

/// Periodic scrape loop over the tracked nodes
pub struct ScrapeScheduler {
    tracker: Arc<NodeTracker>,
    cluster: Arc<dyn ClusterApi>,
    health: HealthRegistry,
    readiness: Vec<ReadySignal>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    worker: ScrapeWorker,
}

impl ScrapeScheduler {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run until a shutdown message arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tokio::select! {
            _ = self.wait_until_ready() => {}
            _ = shutdown.recv() => {
                info!("Scheduler shut down before first tick");
                return;
            }
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.max_concurrent_queries,
            "Starting scrape scheduler"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut allowed_namespaces = None;
        let mut tick_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    allowed_namespaces = self.refresh_namespaces(allowed_namespaces).await;
                    let tick = self.dispatch_tick(allowed_namespaces.clone());
                    tick_count += 1;

                    if tick_count == 1 {
                        self.health.mark_ready();
                    }
                    if tick.dropped > 0 {
                        warn!(
                            dispatched = tick.handles.len(),
                            dropped = tick.dropped,
                            "Worker pool saturated, skipped nodes this tick"
                        );
                    } else {
                        debug!(dispatched = tick.handles.len(), tick = tick_count, "Tick dispatched");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down scrape scheduler");
                    break;
                }
            }
        }
    }

    /// Block on the readiness signals for at most `readiness_timeout`.
    ///
    /// Returns false on timeout, after marking the scheduler degraded.
    pub async fn wait_until_ready(&self) -> bool {
        if wait_all(&self.readiness, self.config.readiness_timeout).await {
            self.health.set_healthy(components::SCHEDULER).await;
            return true;
        }

        warn!(
            timeout_secs = self.config.readiness_timeout.as_secs(),
            "Initial node/pod population did not finish in time, starting degraded"
        );
        self.health
            .set_degraded(components::SCHEDULER, "Started before initial population completed")
            .await;
        false
    }

    /// Re-list the monitored namespaces, keeping the previous list on failure
    pub async fn refresh_namespaces(
        &self,
        previous: Option<Arc<HashSet<String>>>,
    ) -> Option<Arc<HashSet<String>>> {
        let selector = self.config.namespace_selector.as_deref()?;

        match self.cluster.list_namespaces(selector).await {
            Ok(namespaces) => Some(Arc::new(namespaces.into_iter().collect())),
            Err(e) => {
                warn!(error = %e, selector = %selector, "Failed to fetch monitored namespaces");
                // Before the first successful listing nothing is known to be monitored.
                Some(previous.unwrap_or_default())
            }
        }
    }

    /// Submit one task per node in the current snapshot.
    ///
    /// Submission never waits: nodes that find the pool saturated are dropped
    /// for this tick.
    pub fn dispatch_tick(&self, allowed_namespaces: Option<Arc<HashSet<String>>>) -> TickDispatch {
        let mut handles = Vec::new();
        let mut dropped = 0;

        for node in self.tracker.snapshot() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!(node_name = %node.name, "No idle worker, skipping node");
                dropped += 1;
                continue;
            };

            let worker = self.worker.clone();
            let allowed = allowed_namespaces.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                worker.scrape(node, allowed).await
            }));
        }

        TickDispatch { handles, dropped }
    }
}

/// Builder for the scrape scheduler
pub struct ScrapeSchedulerBuilder {
    tracker: Option<Arc<NodeTracker>>,
    cluster: Option<Arc<dyn ClusterApi>>,
    query: Option<SharedQuery>,
    processor: Option<Arc<StatsProcessor>>,
    health: HealthRegistry,
    readiness: Vec<ReadySignal>,
    config: SchedulerConfig,
}

impl ScrapeSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            tracker: None,
            cluster: None,
            query: None,
            processor: None,
            health: HealthRegistry::new(),
            readiness: Vec::new(),
            config: SchedulerConfig::default(),
        }
    }

    pub fn tracker(mut self, tracker: Arc<NodeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn query(mut self, query: SharedQuery) -> Self {
        self.query = Some(query);
        self
    }

    pub fn processor(mut self, processor: Arc<StatsProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    /// Add a signal the first tick waits for
    pub fn wait_for(mut self, signal: ReadySignal) -> Self {
        self.readiness.push(signal);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ScrapeScheduler> {
        let tracker = self
            .tracker
            .ok_or_else(|| anyhow::anyhow!("Node tracker is required"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| anyhow::anyhow!("Cluster API is required"))?;
        let query = self
            .query
            .ok_or_else(|| anyhow::anyhow!("Stats query is required"))?;
        let processor = self
            .processor
            .ok_or_else(|| anyhow::anyhow!("Stats processor is required"))?;

        let workers = self.config.max_concurrent_queries.max(1);
        let worker = ScrapeWorker {
            query,
            metrics: processor.metrics().clone(),
            processor,
            interval: self.config.interval,
            logger: StructuredLogger::new("scheduler"),
        };

        Ok(ScrapeScheduler {
            tracker,
            cluster,
            health: self.health,
            readiness: self.readiness,
            config: self.config,
            permits: Arc::new(Semaphore::new(workers)),
            worker,
        })
    }
}

impl Default for ScrapeSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{DeployMode, NodeTrackerConfig};
    use crate::observability::MetricFeatures;
    use crate::stats::RetryPolicy;
    use crate::testing::{node, summary, FakeCluster, FakeStatsSource};
    use prometheus::Registry;
    use serde_json::json;

    struct Harness {
        scheduler: ScrapeScheduler,
        stats: Arc<FakeStatsSource>,
        cluster: Arc<FakeCluster>,
        metrics: Arc<StorageMetrics>,
        health: HealthRegistry,
    }

    fn harness(nodes: &[&str], config: SchedulerConfig) -> Harness {
        let metrics =
            Arc::new(StorageMetrics::new(Registry::new(), MetricFeatures::all()).unwrap());
        let tracker = Arc::new(NodeTracker::new(
            NodeTrackerConfig {
                mode: DeployMode::Deployment,
                ..Default::default()
            },
            metrics.clone(),
        ));
        for name in nodes {
            tracker.apply(&node(name, true));
        }

        let stats = Arc::new(FakeStatsSource::default());
        let source: Arc<dyn StatsSource> = stats.clone();
        let query = Arc::new(NodeStatsQuery::new(
            source,
            RetryPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                max_elapsed: Duration::from_millis(20),
            },
        ));
        let cluster = Arc::new(FakeCluster::default());
        let health = HealthRegistry::new();

        let scheduler = ScrapeSchedulerBuilder::new()
            .tracker(tracker)
            .cluster(cluster.clone())
            .query(query)
            .processor(Arc::new(StatsProcessor::new(metrics.clone(), None)))
            .health(health.clone())
            .config(config)
            .build()
            .unwrap();

        Harness {
            scheduler,
            stats,
            cluster,
            metrics,
            health,
        }
    }

    async fn outcomes(tick: TickDispatch) -> Vec<ScrapeOutcome> {
        let mut out = Vec::new();
        for handle in tick.handles {
            out.push(handle.await.unwrap());
        }
        out
    }

    #[test]
    fn test_builder_requires_tracker() {
        assert!(ScrapeSchedulerBuilder::new().build().is_err());
    }

    #[tokio::test]
    async fn test_one_query_per_node_per_tick() {
        let h = harness(&["n1", "n2", "n3"], SchedulerConfig::default());
        for n in ["n1", "n2", "n3"] {
            h.stats.set_payload(n, summary(n, &[("p", "ns", 1.0, 2.0, 3.0)]));
        }

        let tick = h.scheduler.dispatch_tick(None);
        assert_eq!(tick.dropped, 0);
        let results = outcomes(tick).await;

        assert_eq!(results.len(), 3);
        for n in ["n1", "n2", "n3"] {
            assert_eq!(h.stats.calls(n), 1);
        }
        assert!(results
            .iter()
            .all(|r| matches!(r, ScrapeOutcome::Recorded { written: 1, .. })));
    }

    #[tokio::test]
    async fn test_saturated_pool_drops_excess() {
        let h = harness(
            &["n1", "n2", "n3"],
            SchedulerConfig {
                max_concurrent_queries: 1,
                ..Default::default()
            },
        );
        for n in ["n1", "n2", "n3"] {
            h.stats.set_payload(n, summary(n, &[]));
        }

        let tick = h.scheduler.dispatch_tick(None);

        assert_eq!(tick.handles.len(), 1);
        assert_eq!(tick.dropped, 2);
        outcomes(tick).await;
        assert_eq!(h.stats.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_query_failure_evicts_node() {
        let h = harness(&["n1"], SchedulerConfig::default());
        h.metrics.node_available.set(&["n1"], 5.0);
        h.metrics.pod_usage.set(&["p", "ns", "n1"], 5.0);

        let results = outcomes(h.scheduler.dispatch_tick(None)).await;

        assert_eq!(results, vec![ScrapeOutcome::QueryFailed]);
        assert_eq!(h.metrics.node_available.get(&["n1"]), None);
        assert_eq!(h.metrics.pod_usage.get(&["p", "ns", "n1"]), None);
        assert_eq!(h.metrics.adjusted_polling_rate.get(&["n1"]), None);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let h = harness(&["n1"], SchedulerConfig::default());
        h.stats.set_payload("n1", json!("not a summary"));

        let results = outcomes(h.scheduler.dispatch_tick(None)).await;

        assert_eq!(results, vec![ScrapeOutcome::ParseFailed]);
    }

    #[tokio::test]
    async fn test_remaining_interval_exported() {
        let h = harness(&["n1"], SchedulerConfig::default());
        h.stats.set_payload("n1", summary("n1", &[]));

        let results = outcomes(h.scheduler.dispatch_tick(None)).await;

        let ScrapeOutcome::Recorded { remaining_ms, .. } = results[0] else {
            panic!("expected a recorded scrape");
        };
        assert!(remaining_ms > 0 && remaining_ms <= 15_000);
        assert_eq!(
            h.metrics.adjusted_polling_rate.get(&["n1"]),
            Some(remaining_ms as f64)
        );
    }

    #[tokio::test]
    async fn test_degraded_start_on_timeout() {
        let mut h = harness(
            &[],
            SchedulerConfig {
                readiness_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        h.scheduler.readiness.push(ReadySignal::new());

        assert!(!h.scheduler.wait_until_ready().await);
        let health = h.health.health().await;
        assert!(matches!(
            health.components.get(components::SCHEDULER).map(|c| c.status),
            Some(crate::health::ComponentStatus::Degraded)
        ));
    }

    #[tokio::test]
    async fn test_ready_signals_release_scheduler() {
        let mut h = harness(&[], SchedulerConfig::default());
        let signal = ReadySignal::new();
        h.scheduler.readiness.push(signal.clone());

        signal.mark_ready();

        assert!(h.scheduler.wait_until_ready().await);
    }

    #[tokio::test]
    async fn test_namespace_refresh_keeps_previous_on_failure() {
        let h = harness(
            &[],
            SchedulerConfig {
                namespace_selector: Some("monitoring=enabled".to_string()),
                ..Default::default()
            },
        );
        h.cluster.set_namespaces(&["a", "b"]);

        let first = h.scheduler.refresh_namespaces(None).await.unwrap();
        assert_eq!(first.len(), 2);

        h.cluster.fail_next_lists(1);
        let kept = h.scheduler.refresh_namespaces(Some(first.clone())).await.unwrap();
        assert!(Arc::ptr_eq(&first, &kept));
    }

    #[tokio::test]
    async fn test_no_selector_means_no_filter() {
        let h = harness(&[], SchedulerConfig::default());
        assert!(h.scheduler.refresh_namespaces(None).await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(
            &["n1"],
            SchedulerConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
        );
        h.stats.set_payload("n1", summary("n1", &[]));
        let (tx, rx) = broadcast::channel(1);
        let health = h.health.clone();
        let stats = h.stats.clone();

        let handle = tokio::spawn(h.scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(stats.calls("n1") >= 1);
        assert!(health.readiness().await.ready);
    }
}
