//! Metrics computation
//!
//! Turns one node's parsed stats summary into gauge writes, joining each pod
//! sample against the cached pod profile for container and volume limits.

use crate::models::{ContainerProfile, PodStats, StatsSummary};
use crate::observability::StorageMetrics;
use crate::pods::PodResourceCache;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reconciles base-1000 usage figures against base-1024 declared limits
pub const BASE_CONVERSION: f64 = 1.024;

/// Which denominator a container percentage was computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSource {
    Container,
    Node,
}

impl LimitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitSource::Container => "container",
            LimitSource::Node => "node",
        }
    }
}

/// Percentage of a container's ephemeral-storage limit in use.
///
/// Without a declared limit, falls back to the node's used share. NaN when
/// neither denominator is usable.
pub fn container_limit_percentage(
    used_bytes: f64,
    limit_bytes: Option<f64>,
    available_bytes: f64,
    capacity_bytes: f64,
) -> (f64, LimitSource) {
    match limit_bytes {
        Some(limit) if limit > 0.0 => (
            (used_bytes * BASE_CONVERSION / limit * 100.0).min(100.0),
            LimitSource::Container,
        ),
        _ if capacity_bytes > 0.0 => (
            (capacity_bytes - available_bytes).max(0.0) * 100.0 / capacity_bytes,
            LimitSource::Node,
        ),
        _ => (f64::NAN, LimitSource::Node),
    }
}

/// Percentage of an emptyDir size limit in use, capped at 100
pub fn volume_limit_percentage(used_bytes: f64, size_limit: f64) -> f64 {
    (used_bytes * BASE_CONVERSION / size_limit * 100.0).min(100.0)
}

/// Share of node ephemeral storage still available.
///
/// Not capped at 100; reads above it when the kubelet reports more available
/// bytes than capacity.
pub fn node_percentage(available_bytes: f64, capacity_bytes: f64) -> f64 {
    if capacity_bytes == 0.0 {
        return f64::NAN;
    }
    available_bytes / capacity_bytes * 100.0
}

pub fn parse_summary(payload: &[u8]) -> Result<StatsSummary> {
    serde_json::from_slice(payload).context("Failed to parse stats summary")
}

/// What happened to the pod samples of one payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub written: usize,
    pub skipped: usize,
}

/// Writes gauges for parsed samples
pub struct StatsProcessor {
    metrics: Arc<StorageMetrics>,
    cache: Option<Arc<PodResourceCache>>,
}

impl StatsProcessor {
    /// `cache` is `None` when no container-scoped family is enabled
    pub fn new(metrics: Arc<StorageMetrics>, cache: Option<Arc<PodResourceCache>>) -> Self {
        Self { metrics, cache }
    }

    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.metrics
    }

    /// Write every enabled gauge for each pod sample of `summary`.
    ///
    /// `node_name` is the queried node, which labels every series regardless
    /// of what the payload reports. Pods outside `allowed_namespaces` (when
    /// given) are skipped.
    pub async fn process(
        &self,
        node_name: &str,
        summary: &StatsSummary,
        allowed_namespaces: Option<&HashSet<String>>,
    ) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        for sample in &summary.pods {
            let pod_name = sample.pod_ref.name.as_str();
            let namespace = sample.pod_ref.namespace.as_str();

            if namespace.is_empty() && sample.ephemeral_storage.is_empty() {
                warn!(
                    pod_name = %pod_name,
                    node_name = %node_name,
                    "Pod has no ephemeral storage figures, skipping"
                );
                outcome.skipped += 1;
                continue;
            }

            if let Some(allowed) = allowed_namespaces {
                if !allowed.contains(namespace) {
                    debug!(
                        pod_name = %pod_name,
                        pod_namespace = %namespace,
                        "Namespace not monitored, skipping"
                    );
                    outcome.skipped += 1;
                    continue;
                }
            }

            self.write_node(node_name, sample);
            self.write_pod(node_name, sample).await;
            outcome.written += 1;
        }

        outcome
    }

    fn write_node(&self, node_name: &str, sample: &PodStats) {
        let features = self.metrics.features();
        let storage = &sample.ephemeral_storage;
        let labels = [node_name];

        if features.node_available {
            self.metrics.node_available.set(&labels, storage.available_bytes);
        }
        if features.node_capacity {
            self.metrics.node_capacity.set(&labels, storage.capacity_bytes);
        }
        if features.node_percentage {
            self.metrics.node_percentage.set(
                &labels,
                node_percentage(storage.available_bytes, storage.capacity_bytes),
            );
        }
    }

    async fn write_pod(&self, node_name: &str, sample: &PodStats) {
        let features = self.metrics.features();
        let storage = &sample.ephemeral_storage;
        let pod_name = sample.pod_ref.name.as_str();
        let namespace = sample.pod_ref.namespace.as_str();
        let labels = [pod_name, namespace, node_name];

        if features.pod_usage {
            self.metrics.pod_usage.set(&labels, storage.used_bytes);
            debug!(
                pod_name = %pod_name,
                pod_namespace = %namespace,
                node_name = %node_name,
                used_bytes = storage.used_bytes,
                "Pod usage recorded"
            );
        }

        if features.inodes {
            if let Some(inodes) = storage.inodes {
                self.metrics.inodes.set(&labels, inodes);
            }
            if let Some(free) = storage.inodes_free {
                self.metrics.inodes_free.set(&labels, free);
            }
            if let Some(used) = storage.inodes_used {
                self.metrics.inodes_used.set(&labels, used);
            }
        }

        if !features.needs_pod_profiles() {
            return;
        }
        let Some(cache) = &self.cache else {
            return;
        };
        let Some(profile) = cache.get(pod_name).await else {
            debug!(pod_name = %pod_name, "No cached profile for pod");
            return;
        };

        for container in &profile.containers {
            if features.container_limit_percentage {
                let (pct, source) = container_limit_percentage(
                    storage.used_bytes,
                    container.limit,
                    storage.available_bytes,
                    storage.capacity_bytes,
                );
                self.metrics.container_limit_percentage.set(
                    &[pod_name, namespace, node_name, &container.name, source.as_str()],
                    pct,
                );
            }
            self.write_volumes(&labels, container, sample);
        }
    }

    fn write_volumes(&self, pod_labels: &[&str; 3], container: &ContainerProfile, sample: &PodStats) {
        let features = self.metrics.features();
        let [pod_name, namespace, node_name] = *pod_labels;

        for mount in &container.empty_dir_mounts {
            let Some(volume) = sample.volumes.iter().find(|v| v.name == mount.volume_name) else {
                continue;
            };
            let labels = [
                pod_name,
                namespace,
                node_name,
                container.name.as_str(),
                volume.name.as_str(),
                mount.mount_path.as_str(),
            ];

            if features.container_volume_usage {
                self.metrics.container_volume_usage.set(&labels, volume.used_bytes);
            }
            if features.container_volume_limit_percentage {
                if let Some(size_limit) = mount.size_limit.filter(|l| *l > 0.0) {
                    self.metrics
                        .container_volume_limit_percentage
                        .set(&labels, volume_limit_percentage(volume.used_bytes, size_limit));
                }
            }
        }
    }
}
