//! Exporter configuration
//!
//! Every setting comes from an unprefixed environment variable, e.g.
//! `SCRAPE_INTERVAL=30` or `EPHEMERAL_STORAGE_POD_USAGE=true`.

use anyhow::{bail, Context, Result};
use exporter_lib::gc::GcConfig;
use exporter_lib::nodes::{DeployMode, NodeTrackerConfig};
use exporter_lib::observability::MetricFeatures;
use exporter_lib::pods::ProfileOptions;
use exporter_lib::scheduler::SchedulerConfig;
use exporter_lib::stats::KubeletClientConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    /// Sample interval in seconds
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,

    #[serde(default = "default_max_node_concurrency")]
    pub max_node_concurrency: usize,

    /// Port for /metrics, /healthz and /readyz
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// `DaemonSet` or `Deployment`
    #[serde(default = "default_deploy_type")]
    pub deploy_type: String,

    /// Local node name from the downward API, required in DaemonSet mode
    #[serde(default)]
    pub current_node_name: String,

    #[serde(default)]
    pub ephemeral_storage_pod_usage: bool,
    #[serde(default)]
    pub ephemeral_storage_node_available: bool,
    #[serde(default)]
    pub ephemeral_storage_node_capacity: bool,
    #[serde(default)]
    pub ephemeral_storage_node_percentage: bool,
    #[serde(default)]
    pub ephemeral_storage_container_limit_percentage: bool,
    #[serde(default)]
    pub ephemeral_storage_container_volume_limits_percentage: bool,
    #[serde(default)]
    pub ephemeral_storage_container_volume_usage: bool,
    #[serde(default)]
    pub ephemeral_storage_inodes: bool,
    #[serde(default)]
    pub adjusted_polling_rate: bool,

    #[serde(default)]
    pub gc_enabled: bool,

    /// Garbage collection period in minutes
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,

    #[serde(default = "default_gc_batch_size")]
    pub gc_batch_size: u32,

    /// Query kubelets directly instead of through the API server proxy
    #[serde(default)]
    pub scrape_from_kubelet: bool,

    /// Unauthenticated kubelet port; 0 uses the node-reported secure port
    #[serde(default)]
    pub kubelet_readonly_port: u16,

    #[serde(default)]
    pub kubelet_insecure_skip_tls_verify: bool,

    /// Namespace label selector for the monitored-namespace allow-list.
    ///
    /// Unset or blank turns namespace filtering off and every namespace is
    /// scraped; there is no default selector such as
    /// `ephemeral-storage-monitoring=enabled`.
    #[serde(default)]
    pub ephemeral_storage_label: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_scrape_interval() -> u64 {
    15
}

fn default_max_node_concurrency() -> usize {
    10
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_deploy_type() -> String {
    "DaemonSet".to_string()
}

fn default_gc_interval() -> u64 {
    5
}

fn default_gc_batch_size() -> u32 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ExporterConfig {
    /// Load and validate configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::from_env(None)
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn from_env(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: ExporterConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mode = self.deploy_mode()?;
        if mode == DeployMode::DaemonSet && self.current_node_name.trim().is_empty() {
            bail!("CURRENT_NODE_NAME must be set when DEPLOY_TYPE is DaemonSet");
        }
        if self.scrape_interval == 0 {
            bail!("SCRAPE_INTERVAL must be at least 1 second");
        }
        if self.gc_enabled && self.gc_interval == 0 {
            bail!("GC_INTERVAL must be at least 1 minute");
        }
        Ok(())
    }

    pub fn deploy_mode(&self) -> Result<DeployMode> {
        match self.deploy_type.as_str() {
            "DaemonSet" => Ok(DeployMode::DaemonSet),
            "Deployment" => Ok(DeployMode::Deployment),
            other => bail!(
                "DEPLOY_TYPE must be DaemonSet or Deployment, got {:?}",
                other
            ),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval)
    }

    pub fn features(&self) -> MetricFeatures {
        MetricFeatures {
            pod_usage: self.ephemeral_storage_pod_usage,
            node_available: self.ephemeral_storage_node_available,
            node_capacity: self.ephemeral_storage_node_capacity,
            node_percentage: self.ephemeral_storage_node_percentage,
            container_limit_percentage: self.ephemeral_storage_container_limit_percentage,
            container_volume_limit_percentage: self
                .ephemeral_storage_container_volume_limits_percentage,
            container_volume_usage: self.ephemeral_storage_container_volume_usage,
            inodes: self.ephemeral_storage_inodes,
            adjusted_polling_rate: self.adjusted_polling_rate,
        }
    }

    pub fn tracker_config(&self) -> Result<NodeTrackerConfig> {
        Ok(NodeTrackerConfig {
            mode: self.deploy_mode()?,
            self_node_name: self.current_node_name.clone(),
            scrape_from_kubelet: self.scrape_from_kubelet,
            kubelet_read_only_port: self.kubelet_readonly_port,
            ..Default::default()
        })
    }

    pub fn profile_options(&self) -> ProfileOptions {
        let features = self.features();
        ProfileOptions {
            container_limits: features.container_limit_percentage,
            volumes: features.needs_volume_profiles(),
            ..Default::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: self.interval(),
            max_concurrent_queries: self.max_node_concurrency.max(1),
            readiness_timeout: self.interval().saturating_mul(2),
            namespace_selector: self
                .ephemeral_storage_label
                .clone()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn gc_config(&self) -> GcConfig {
        GcConfig {
            interval: Duration::from_secs(self.gc_interval.saturating_mul(60)),
            batch_size: self.gc_batch_size.max(1),
        }
    }

    pub fn kubelet_config(&self) -> KubeletClientConfig {
        KubeletClientConfig {
            insecure_skip_tls_verify: self.kubelet_insecure_skip_tls_verify,
            ..Default::default()
        }
    }
}
