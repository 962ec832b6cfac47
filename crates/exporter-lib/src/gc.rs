//! Garbage collection sweeps
//!
//! Two independent periodic reconciliations, one for nodes and one for pods,
//! that delete tracked state absent from a fresh listing. They compensate for
//! watch events the streams dropped.

use crate::cluster::ClusterApi;
use crate::health::{components, HealthRegistry};
use crate::nodes::NodeTracker;
use crate::observability::StructuredLogger;
use crate::pods::PodResourceCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
enum SweepDomain {
    Node,
    Pod,
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Period of each sweep (default: 5 minutes)
    pub interval: Duration,
    /// Page size for the pod listing
    pub batch_size: u32,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 500,
        }
    }
}

pub struct GarbageCollector {
    cluster: Arc<dyn ClusterApi>,
    tracker: Arc<NodeTracker>,
    cache: Option<Arc<PodResourceCache>>,
    health: HealthRegistry,
    config: GcConfig,
    logger: StructuredLogger,
}

impl GarbageCollector {
    /// `cache` is `None` when pods are not tracked; only nodes are swept then
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        tracker: Arc<NodeTracker>,
        cache: Option<Arc<PodResourceCache>>,
        health: HealthRegistry,
        config: GcConfig,
    ) -> Self {
        Self {
            cluster,
            tracker,
            cache,
            health,
            config,
            logger: StructuredLogger::new("garbage_collector"),
        }
    }

    /// One node sweep; failures mark the collector degraded
    pub async fn sweep_nodes(&self) -> bool {
        let start = Instant::now();
        match self.tracker.gc_sweep(self.cluster.as_ref()).await {
            Ok((listed, removed)) => {
                self.logger
                    .log_gc_sweep("node", listed, removed, start.elapsed().as_millis());
                self.health.set_healthy(components::GARBAGE_COLLECTOR).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Node garbage collection failed, retrying next interval");
                self.health
                    .set_degraded(components::GARBAGE_COLLECTOR, format!("Node sweep failed: {}", e))
                    .await;
                false
            }
        }
    }

    /// One paginated pod sweep; a no-op without a pod cache
    pub async fn sweep_pods(&self) -> bool {
        let Some(cache) = &self.cache else {
            return true;
        };

        let start = Instant::now();
        match cache
            .gc_sweep(self.cluster.as_ref(), self.config.batch_size)
            .await
        {
            Ok((listed, removed)) => {
                self.logger
                    .log_gc_sweep("pod", listed, removed, start.elapsed().as_millis());
                self.health.set_healthy(components::GARBAGE_COLLECTOR).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Pod garbage collection failed, retrying next interval");
                self.health
                    .set_degraded(components::GARBAGE_COLLECTOR, format!("Pod sweep failed: {}", e))
                    .await;
                false
            }
        }
    }

    /// Spawn the node and pod sweep loops; both stop on shutdown
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            pods = self.cache.is_some(),
            "Starting garbage collector"
        );

        let gc = Arc::new(self);
        let mut handles = vec![tokio::spawn(Self::sweep_loop(
            gc.clone(),
            SweepDomain::Node,
            shutdown.subscribe(),
        ))];
        if gc.cache.is_some() {
            handles.push(tokio::spawn(Self::sweep_loop(
                gc,
                SweepDomain::Pod,
                shutdown.subscribe(),
            )));
        }
        handles
    }

    async fn sweep_loop(gc: Arc<Self>, domain: SweepDomain, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(gc.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; initial population already covers it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match domain {
                        SweepDomain::Node => gc.sweep_nodes().await,
                        SweepDomain::Pod => gc.sweep_pods().await,
                    };
                }
                _ = shutdown.recv() => {
                    info!(domain = ?domain, "Shutting down garbage collector");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::nodes::{DeployMode, NodeTrackerConfig};
    use crate::observability::{MetricFeatures, StorageMetrics};
    use crate::pods::ProfileOptions;
    use crate::testing::{node, running_pod, FakeCluster};
    use prometheus::Registry;

    struct Harness {
        gc: GarbageCollector,
        cluster: Arc<FakeCluster>,
        tracker: Arc<NodeTracker>,
        cache: Arc<PodResourceCache>,
        health: HealthRegistry,
    }

    async fn harness() -> Harness {
        let metrics =
            Arc::new(StorageMetrics::new(Registry::new(), MetricFeatures::all()).unwrap());
        let cluster = Arc::new(FakeCluster::with_nodes(vec![node("n1", true), node("n2", true)]));
        cluster.set_pods(vec![
            running_pod("p1", "ns", &[("c1", None)]),
            running_pod("p2", "ns", &[("c2", None)]),
        ]);

        let tracker = Arc::new(NodeTracker::new(
            NodeTrackerConfig {
                mode: DeployMode::Deployment,
                ..Default::default()
            },
            metrics.clone(),
        ));
        tracker.initialize(cluster.as_ref()).await;
        let cache = Arc::new(PodResourceCache::new(ProfileOptions::default(), metrics));
        cache.initialize(cluster.as_ref()).await;

        let health = HealthRegistry::new();
        let gc = GarbageCollector::new(
            cluster.clone(),
            tracker.clone(),
            Some(cache.clone()),
            health.clone(),
            GcConfig {
                interval: Duration::from_millis(10),
                batch_size: 1,
            },
        );

        Harness {
            gc,
            cluster,
            tracker,
            cache,
            health,
        }
    }

    async fn gc_status(health: &HealthRegistry) -> Option<ComponentStatus> {
        health
            .health()
            .await
            .components
            .get(components::GARBAGE_COLLECTOR)
            .map(|c| c.status)
    }

    #[tokio::test]
    async fn test_sweeps_remove_absent_entities() {
        let h = harness().await;
        h.cluster.set_nodes(vec![node("n2", true)]);
        h.cluster
            .set_pods(vec![running_pod("p2", "ns", &[("c2", None)])]);

        assert!(h.gc.sweep_nodes().await);
        assert!(h.gc.sweep_pods().await);

        assert!(!h.tracker.contains("n1"));
        assert!(h.tracker.contains("n2"));
        assert!(!h.cache.contains("p1").await);
        assert!(h.cache.contains("p2").await);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let h = harness().await;
        h.cluster.set_nodes(vec![]);

        assert!(h.gc.sweep_nodes().await);
        assert!(h.gc.sweep_nodes().await);
        assert!(h.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_degrades_then_recovers() {
        let h = harness().await;

        h.cluster.fail_next_lists(1);
        assert!(!h.gc.sweep_pods().await);
        assert_eq!(gc_status(&h.health).await, Some(ComponentStatus::Degraded));
        assert_eq!(h.cache.len().await, 2);

        assert!(h.gc.sweep_pods().await);
        assert_eq!(gc_status(&h.health).await, Some(ComponentStatus::Healthy));
    }

    #[tokio::test]
    async fn test_spawned_loops_sweep_and_stop() {
        let h = harness().await;
        h.cluster.set_nodes(vec![node("n1", true)]);
        let (tx, _rx) = broadcast::channel(1);

        let handles = h.gc.spawn(&tx);
        assert_eq!(handles.len(), 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!h.tracker.contains("n2"));
    }
}
