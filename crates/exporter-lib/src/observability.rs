//! Observability infrastructure for the exporter
//!
//! Provides:
//! - The ephemeral storage gauge families, registered on an injected Prometheus registry
//! - Label-superset eviction of series for vanished nodes, pods and containers
//! - Structured JSON logging of lifecycle events with tracing

use dashmap::DashMap;
use prometheus::{GaugeVec, Opts, Registry};
use tracing::{debug, info, warn};

pub const POD_LABELS: &[&str] = &["pod_name", "pod_namespace", "node_name"];
pub const NODE_LABELS: &[&str] = &["node_name"];
pub const CONTAINER_LIMIT_LABELS: &[&str] =
    &["pod_name", "pod_namespace", "node_name", "container", "source"];
pub const CONTAINER_VOLUME_LABELS: &[&str] = &[
    "pod_name",
    "pod_namespace",
    "node_name",
    "container",
    "volume_name",
    "mount_path",
];

/// Which gauge families get written on each scrape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricFeatures {
    pub pod_usage: bool,
    pub node_available: bool,
    pub node_capacity: bool,
    pub node_percentage: bool,
    pub container_limit_percentage: bool,
    pub container_volume_limit_percentage: bool,
    pub container_volume_usage: bool,
    pub inodes: bool,
    pub adjusted_polling_rate: bool,
}

impl MetricFeatures {
    /// Every family enabled
    pub fn all() -> Self {
        Self {
            pod_usage: true,
            node_available: true,
            node_capacity: true,
            node_percentage: true,
            container_limit_percentage: true,
            container_volume_limit_percentage: true,
            container_volume_usage: true,
            inodes: true,
            adjusted_polling_rate: true,
        }
    }

    /// Pod specs must be cached before the first scrape
    pub fn needs_pod_profiles(&self) -> bool {
        self.container_limit_percentage
            || self.container_volume_limit_percentage
            || self.container_volume_usage
    }

    /// Volume mounts must be captured in the pod profiles
    pub fn needs_volume_profiles(&self) -> bool {
        self.container_volume_limit_percentage || self.container_volume_usage
    }

    /// Any pod-scoped family is exported
    pub fn tracks_pods(&self) -> bool {
        self.pod_usage || self.inodes || self.needs_pod_profiles()
    }
}

/// A gauge family that remembers its live label tuples so series can be
/// deleted by partial label match.
pub struct TrackedGaugeVec {
    vec: GaugeVec,
    label_names: &'static [&'static str],
    series: DashMap<Vec<String>, ()>,
}

impl TrackedGaugeVec {
    fn new(
        registry: &Registry,
        name: &str,
        help: &str,
        label_names: &'static [&'static str],
    ) -> prometheus::Result<Self> {
        let vec = GaugeVec::new(Opts::new(name, help), label_names)?;
        registry.register(Box::new(vec.clone()))?;
        Ok(Self {
            vec,
            label_names,
            series: DashMap::new(),
        })
    }

    /// Set the series identified by `values` (ordered as the family's labels)
    pub fn set(&self, values: &[&str], value: f64) {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        // Holding the entry keeps a concurrent delete from orphaning the series.
        let _entry = self.series.entry(key).or_insert(());
        self.vec.with_label_values(values).set(value);
    }

    /// Current value of a series, if it exists
    pub fn get(&self, values: &[&str]) -> Option<f64> {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let _entry = self.series.get(&key)?;
        self.vec.get_metric_with_label_values(values).ok().map(|g| g.get())
    }

    /// Delete every series whose `label` equals `value`; returns how many went
    pub fn delete_partial_match(&self, label: &str, value: &str) -> usize {
        let Some(index) = self.label_names.iter().position(|l| *l == label) else {
            return 0;
        };

        let matching: Vec<Vec<String>> = self
            .series
            .iter()
            .filter(|entry| entry.key()[index] == value)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            let deleted = self.series.remove_if(&key, |key, _| {
                let values: Vec<&str> = key.iter().map(String::as_str).collect();
                if let Err(e) = self.vec.remove_label_values(&values) {
                    debug!(error = %e, "Series already absent from gauge family");
                }
                true
            });
            if deleted.is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.label_names.contains(&label)
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

/// The exporter's metric sink.
///
/// Owned by the composition root and shared by reference with every component;
/// all families live on the registry passed in, never on the process-global one.
pub struct StorageMetrics {
    registry: Registry,
    features: MetricFeatures,
    pub pod_usage: TrackedGaugeVec,
    pub node_available: TrackedGaugeVec,
    pub node_capacity: TrackedGaugeVec,
    pub node_percentage: TrackedGaugeVec,
    pub container_limit_percentage: TrackedGaugeVec,
    pub container_volume_limit_percentage: TrackedGaugeVec,
    pub container_volume_usage: TrackedGaugeVec,
    pub inodes: TrackedGaugeVec,
    pub inodes_free: TrackedGaugeVec,
    pub inodes_used: TrackedGaugeVec,
    pub adjusted_polling_rate: TrackedGaugeVec,
}

impl StorageMetrics {
    pub fn new(registry: Registry, features: MetricFeatures) -> prometheus::Result<Self> {
        let r = &registry;
        Ok(Self {
            pod_usage: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_pod_usage",
                "Current ephemeral byte usage of pod",
                POD_LABELS,
            )?,
            node_available: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_node_available",
                "Available ephemeral storage for a node",
                NODE_LABELS,
            )?,
            node_capacity: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_node_capacity",
                "Capacity of ephemeral storage for a node",
                NODE_LABELS,
            )?,
            node_percentage: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_node_percentage",
                "Percentage of ephemeral storage available on a node",
                NODE_LABELS,
            )?,
            container_limit_percentage: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_container_limit_percentage",
                "Percentage of ephemeral storage used by a container in a pod",
                CONTAINER_LIMIT_LABELS,
            )?,
            container_volume_limit_percentage: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_container_volume_limit_percentage",
                "Percentage of ephemeral storage used by a container's volume in a pod",
                CONTAINER_VOLUME_LABELS,
            )?,
            container_volume_usage: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_container_volume_usage",
                "Current ephemeral storage used by a container's volume in a pod",
                CONTAINER_VOLUME_LABELS,
            )?,
            inodes: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_inodes",
                "Maximum number of inodes in the pod",
                POD_LABELS,
            )?,
            inodes_free: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_inodes_free",
                "Number of free inodes in the pod",
                POD_LABELS,
            )?,
            inodes_used: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_inodes_used",
                "Number of used inodes in the pod",
                POD_LABELS,
            )?,
            adjusted_polling_rate: TrackedGaugeVec::new(
                r,
                "ephemeral_storage_adjusted_polling_rate",
                "Time left in the polling interval after a node query, in milliseconds",
                NODE_LABELS,
            )?,
            registry,
            features,
        })
    }

    pub fn features(&self) -> MetricFeatures {
        self.features
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn families(&self) -> [&TrackedGaugeVec; 11] {
        [
            &self.pod_usage,
            &self.node_available,
            &self.node_capacity,
            &self.node_percentage,
            &self.container_limit_percentage,
            &self.container_volume_limit_percentage,
            &self.container_volume_usage,
            &self.inodes,
            &self.inodes_free,
            &self.inodes_used,
            &self.adjusted_polling_rate,
        ]
    }

    fn delete_matching(&self, label: &str, value: &str) -> usize {
        self.families()
            .iter()
            .filter(|family| family.has_label(label))
            .map(|family| family.delete_partial_match(label, value))
            .sum()
    }

    /// Delete every series carrying `node_name`; a no-op when none exist
    pub fn evict_node(&self, node_name: &str) -> usize {
        self.delete_matching("node_name", node_name)
    }

    /// Delete every series carrying `pod_name`, then every series carrying any
    /// of the given container names
    pub fn evict_pod(&self, pod_name: &str, container_names: &[String]) -> usize {
        let mut removed = self.delete_matching("pod_name", pod_name);
        for container in container_names {
            removed += self.delete_matching("container", container);
        }
        removed
    }

    /// Total number of live series across all families
    pub fn series_count(&self) -> usize {
        self.families().iter().map(|f| f.series_count()).sum()
    }
}

/// Structured logger for exporter events
///
/// Provides consistent JSON-formatted records for lifecycle events that
/// operators alert on.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Log exporter startup
    pub fn log_startup(&self, version: &str, mode: &str, features: &MetricFeatures) {
        info!(
            event = "exporter_started",
            component = %self.component,
            version = %version,
            mode = %mode,
            features = ?features,
            "Ephemeral storage exporter started"
        );
    }

    /// Log exporter shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            component = %self.component,
            reason = %reason,
            "Ephemeral storage exporter shutting down"
        );
    }

    /// Log removal of a node's series
    pub fn log_node_evicted(&self, node_name: &str, series: usize, cause: &str) {
        info!(
            event = "node_evicted",
            component = %self.component,
            node_name = %node_name,
            series = series,
            cause = %cause,
            "Node removed from monitoring"
        );
    }

    /// Log removal of a pod's series
    pub fn log_pod_evicted(&self, pod_name: &str, series: usize, cause: &str) {
        info!(
            event = "pod_evicted",
            component = %self.component,
            pod_name = %pod_name,
            series = series,
            cause = %cause,
            "Pod removed from monitoring"
        );
    }

    /// Log the outcome of a garbage collection sweep
    pub fn log_gc_sweep(&self, domain: &str, listed: usize, removed: usize, elapsed_ms: u128) {
        info!(
            event = "gc_sweep",
            component = %self.component,
            domain = %domain,
            listed = listed,
            removed = removed,
            elapsed_ms = elapsed_ms,
            "Garbage collection sweep complete"
        );
    }

    /// Log a node query that consumed its whole polling interval
    pub fn log_polling_lag(&self, node_name: &str, remaining_ms: i64, interval_secs: u64) {
        warn!(
            event = "polling_lag",
            component = %self.component,
            node_name = %node_name,
            remaining_ms = remaining_ms,
            interval_secs = interval_secs,
            "Polling rate could not keep up, raise the scrape interval"
        );
    }
}
