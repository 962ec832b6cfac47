//! Node membership tracking
//!
//! Maintains the authoritative set of scrape targets. In DaemonSet mode the set
//! is just the local node; in Deployment mode it follows the cluster's ready
//! nodes through an initial listing, a watch stream and periodic GC sweeps.

use crate::cluster::ClusterApi;
use crate::models::MonitoredNode;
use crate::observability::{StorageMetrics, StructuredLogger};
use crate::readiness::ReadySignal;
use anyhow::Result;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the exporter is deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DeployMode {
    /// One exporter per node, scraping only the local node
    DaemonSet,
    /// A single exporter scraping every node in the cluster
    Deployment,
}

impl DeployMode {
    pub fn is_cluster_wide(&self) -> bool {
        matches!(self, DeployMode::Deployment)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::DaemonSet => "DaemonSet",
            DeployMode::Deployment => "Deployment",
        }
    }
}

/// Configuration for the node tracker
#[derive(Debug, Clone)]
pub struct NodeTrackerConfig {
    pub mode: DeployMode,
    /// Local node name, used in DaemonSet mode
    pub self_node_name: String,
    /// Resolve direct kubelet endpoints for each node
    pub scrape_from_kubelet: bool,
    /// Unauthenticated kubelet port; 0 uses the node-reported secure port
    pub kubelet_read_only_port: u16,
    /// Delay between failed initial listings
    pub init_retry_interval: Duration,
}

impl Default for NodeTrackerConfig {
    fn default() -> Self {
        Self {
            mode: DeployMode::DaemonSet,
            self_node_name: String::new(),
            scrape_from_kubelet: false,
            kubelet_read_only_port: 0,
            init_retry_interval: Duration::from_secs(15),
        }
    }
}

/// True when the node reports a `Ready=True` condition
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Build the direct kubelet base URL from the node's InternalIP.
///
/// A non-zero read-only port yields a plain HTTP endpoint; otherwise the
/// node-reported secure kubelet port is used over HTTPS.
pub fn resolve_endpoint(node: &Node, read_only_port: u16) -> Option<String> {
    let status = node.status.as_ref()?;
    let ip = status
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())?;

    if read_only_port != 0 {
        return Some(format!("http://{}:{}", ip, read_only_port));
    }

    let port = status
        .daemon_endpoints
        .as_ref()
        .and_then(|d| d.kubelet_endpoint.as_ref())
        .map(|e| e.port)
        .filter(|p| *p > 0)?;
    Some(format!("https://{}:{}", ip, port))
}

/// Tracks which nodes get scraped
pub struct NodeTracker {
    config: NodeTrackerConfig,
    nodes: DashMap<String, MonitoredNode>,
    metrics: Arc<StorageMetrics>,
    ready: ReadySignal,
    logger: StructuredLogger,
}

impl NodeTracker {
    pub fn new(config: NodeTrackerConfig, metrics: Arc<StorageMetrics>) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
            metrics,
            ready: ReadySignal::new(),
            logger: StructuredLogger::new("node_tracker"),
        }
    }

    /// Signal fired once the initial population completes
    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }

    pub fn mode(&self) -> DeployMode {
        self.config.mode
    }

    /// Point-in-time copy of the tracked nodes
    pub fn snapshot(&self) -> Vec<MonitoredNode> {
        self.nodes.iter().map(|r| r.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<MonitoredNode> {
        self.nodes.get(name).map(|r| r.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Populate the node set and fire the readiness signal.
    ///
    /// Listing failures are retried every `init_retry_interval`; they are never fatal.
    pub async fn initialize(&self, cluster: &dyn ClusterApi) {
        loop {
            match self.try_initialize(cluster).await {
                Ok(count) => {
                    info!(nodes = count, mode = self.config.mode.as_str(), "Node set initialized");
                    break;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_secs = self.config.init_retry_interval.as_secs(),
                        "Initial node listing failed, retrying"
                    );
                    tokio::time::sleep(self.config.init_retry_interval).await;
                }
            }
        }
        self.ready.mark_ready();
    }

    /// One population attempt; returns the number of tracked nodes
    pub async fn try_initialize(&self, cluster: &dyn ClusterApi) -> Result<usize> {
        if !self.config.mode.is_cluster_wide() {
            self.seed_self_node(cluster).await;
            return Ok(self.nodes.len());
        }

        for node in cluster.list_nodes().await? {
            self.apply(&node);
        }
        Ok(self.nodes.len())
    }

    async fn seed_self_node(&self, cluster: &dyn ClusterApi) {
        let name = self.config.self_node_name.clone();
        let mut monitored = MonitoredNode::new(&name);

        if self.config.scrape_from_kubelet {
            match cluster.get_node(&name).await {
                Ok(node) => {
                    monitored.endpoint =
                        resolve_endpoint(&node, self.config.kubelet_read_only_port);
                }
                Err(e) => warn!(
                    node_name = %name,
                    error = %e,
                    "Could not resolve kubelet endpoint, falling back to API server proxy"
                ),
            }
        }

        self.nodes.insert(name, monitored);
    }

    /// Handle an added or updated node object.
    ///
    /// Ready nodes are (re)inserted; a node that turns not-ready stays tracked
    /// until it is deleted. Returns true when the node is tracked afterwards.
    pub fn apply(&self, node: &Node) -> bool {
        let name = node.name_any();
        if !is_node_ready(node) {
            debug!(node_name = %name, "Node not ready");
            return self.nodes.contains_key(&name);
        }

        let endpoint = if self.config.scrape_from_kubelet {
            resolve_endpoint(node, self.config.kubelet_read_only_port)
        } else {
            None
        };

        if !self.nodes.contains_key(&name) {
            info!(node_name = %name, endpoint = ?endpoint, "Tracking node");
        }
        self.nodes.insert(
            name.clone(),
            MonitoredNode {
                name,
                endpoint,
            },
        );
        true
    }

    /// Stop tracking a node and delete its series
    pub fn remove(&self, name: &str, cause: &str) -> bool {
        let existed = self.nodes.remove(name).is_some();
        let series = self.metrics.evict_node(name);
        self.logger.log_node_evicted(name, series, cause);
        existed
    }

    /// Apply one watch event
    pub fn handle_event(&self, event: Event<Node>) {
        match event {
            Event::Applied(node) => {
                self.apply(&node);
            }
            Event::Deleted(node) => {
                self.remove(&node.name_any(), "watch_delete");
            }
            Event::Restarted(nodes) => {
                debug!(count = nodes.len(), "Node watch relisted");
                for node in &nodes {
                    self.apply(node);
                }
            }
        }
    }

    /// Follow node events until the stream ends.
    ///
    /// Transient watch errors are backed off and retried; an ended stream is
    /// returned as an error so the process can exit and be restarted.
    pub async fn watch(&self, api: Api<Node>) -> Result<()> {
        info!("Starting node watch");
        let mut stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_event(event),
                Err(e) => warn!(error = %e, "Node watch error, backing off"),
            }
        }

        anyhow::bail!("node watch stream terminated")
    }

    /// Evict every tracked node absent from a fresh listing.
    ///
    /// Returns `(listed, removed)`.
    pub async fn gc_sweep(&self, cluster: &dyn ClusterApi) -> Result<(usize, usize)> {
        let listed: HashSet<String> = cluster
            .list_nodes()
            .await?
            .iter()
            .map(|n| n.name_any())
            .collect();

        let stale: Vec<String> = self
            .nodes
            .iter()
            .map(|r| r.key().clone())
            .filter(|name| !listed.contains(name))
            .collect();

        for name in &stale {
            info!(node_name = %name, "Garbage collector removing metrics for deleted node");
            self.remove(name, "gc_sweep");
        }

        Ok((listed.len(), stale.len()))
    }
}
