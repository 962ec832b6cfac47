//! Core data models for the exporter
//!
//! Cluster-side profiles derived from pod specs, the tracked scrape targets,
//! and the kubelet stats summary payload consumed on every scrape.

use serde::{Deserialize, Serialize};

/// A node currently tracked as a scrape target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredNode {
    pub name: String,
    /// Direct kubelet base URL (e.g. `https://10.0.0.4:10250`), when resolved
    pub endpoint: Option<String>,
}

impl MonitoredNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
        }
    }

    pub fn with_endpoint(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: Some(endpoint.into()),
        }
    }
}

/// An emptyDir volume mounted into a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmptyDirMount {
    pub volume_name: String,
    pub mount_path: String,
    /// Declared `sizeLimit` in bytes
    pub size_limit: Option<f64>,
}

/// Per-container resource data derived from the pod spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerProfile {
    pub name: String,
    /// Declared `ephemeral-storage` limit in bytes
    pub limit: Option<f64>,
    pub empty_dir_mounts: Vec<EmptyDirMount>,
}

/// Ordered container profiles of a running pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodProfile {
    pub containers: Vec<ContainerProfile>,
}

impl PodProfile {
    pub fn container_names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }
}

/// Kubelet `/stats/summary` payload, reduced to the fields we export
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsSummary {
    #[serde(default)]
    pub node: NodeRef,
    #[serde(default)]
    pub pods: Vec<PodStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    #[serde(default)]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    #[serde(default)]
    pub pod_ref: PodRef,
    #[serde(default, rename = "ephemeral-storage")]
    pub ephemeral_storage: EphemeralStorageStats,
    #[serde(default, rename = "volume")]
    pub volumes: Vec<VolumeStats>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodRef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralStorageStats {
    #[serde(default)]
    pub available_bytes: f64,
    #[serde(default)]
    pub capacity_bytes: f64,
    #[serde(default)]
    pub used_bytes: f64,
    #[serde(default)]
    pub inodes: Option<f64>,
    #[serde(default)]
    pub inodes_free: Option<f64>,
    #[serde(default)]
    pub inodes_used: Option<f64>,
}

impl EphemeralStorageStats {
    /// True when every size and inode figure is zero or absent
    pub fn is_empty(&self) -> bool {
        self.available_bytes == 0.0
            && self.capacity_bytes == 0.0
            && self.used_bytes == 0.0
            && self.inodes.unwrap_or(0.0) == 0.0
            && self.inodes_free.unwrap_or(0.0) == 0.0
            && self.inodes_used.unwrap_or(0.0) == 0.0
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub available_bytes: f64,
    #[serde(default)]
    pub capacity_bytes: f64,
    #[serde(default)]
    pub used_bytes: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_summary_deserialize() {
        let payload = r#"{
            "node": {"nodeName": "n1", "cpu": {"usageNanoCores": 1}},
            "pods": [{
                "podRef": {"name": "p1", "namespace": "ns1", "uid": "abc"},
                "ephemeral-storage": {
                    "availableBytes": 900000, "capacityBytes": 1000000, "usedBytes": 100000,
                    "inodes": 100, "inodesFree": 60, "inodesUsed": 40
                },
                "volume": [{"name": "scratch", "availableBytes": 10, "capacityBytes": 20, "usedBytes": 5}]
            }]
        }"#;

        let summary: StatsSummary = serde_json::from_str(payload).unwrap();
        assert_eq!(summary.node.node_name, "n1");
        assert_eq!(summary.pods.len(), 1);

        let pod = &summary.pods[0];
        assert_eq!(pod.pod_ref.name, "p1");
        assert_eq!(pod.ephemeral_storage.used_bytes, 100000.0);
        assert_eq!(pod.ephemeral_storage.inodes_used, Some(40.0));
        assert_eq!(pod.volumes[0].name, "scratch");
        assert_eq!(pod.volumes[0].used_bytes, 5.0);
    }

    #[test]
    fn test_pod_stats_missing_sections_default() {
        let summary: StatsSummary =
            serde_json::from_str(r#"{"node": {"nodeName": "n1"}, "pods": [{"podRef": {"name": "p"}}]}"#)
                .unwrap();

        let pod = &summary.pods[0];
        assert!(pod.pod_ref.namespace.is_empty());
        assert!(pod.ephemeral_storage.is_empty());
        assert!(pod.volumes.is_empty());
    }

    #[test]
    fn test_is_empty_considers_inodes() {
        let stats = EphemeralStorageStats {
            inodes_free: Some(3.0),
            ..Default::default()
        };
        assert!(!stats.is_empty());
    }
}
