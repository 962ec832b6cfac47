//! Pod resource cache
//!
//! Keeps a per-pod profile of container ephemeral-storage limits and emptyDir
//! mounts, keyed by pod name. Watch callbacks and GC sweeps are the only
//! writers; the scrape path only reads.

use crate::cluster::ClusterApi;
use crate::models::{ContainerProfile, EmptyDirMount, PodProfile};
use crate::observability::{StorageMetrics, StructuredLogger};
use crate::quantity::quantity_to_f64;
use crate::readiness::ReadySignal;
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
const RUNNING: &str = "Running";

/// What gets captured in each profile
#[derive(Debug, Clone)]
pub struct ProfileOptions {
    /// Record declared container ephemeral-storage limits
    pub container_limits: bool,
    /// Record emptyDir mounts per container
    pub volumes: bool,
    /// Delay between failed initial listings
    pub init_retry_interval: Duration,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            container_limits: true,
            volumes: true,
            init_retry_interval: Duration::from_secs(15),
        }
    }
}

/// Derive the profile of a running pod; `None` for any other phase
pub fn compute_profile(pod: &Pod, options: &ProfileOptions) -> Option<PodProfile> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some(RUNNING) {
        return None;
    }

    let Some(spec) = pod.spec.as_ref() else {
        return Some(PodProfile::default());
    };

    // emptyDir volume name -> declared size limit
    let empty_dirs: HashMap<&str, Option<f64>> = spec
        .volumes
        .iter()
        .flatten()
        .filter_map(|v| {
            let empty_dir = v.empty_dir.as_ref()?;
            Some((
                v.name.as_str(),
                empty_dir.size_limit.as_ref().and_then(quantity_to_f64),
            ))
        })
        .collect();

    let containers = spec
        .containers
        .iter()
        .map(|c| container_profile(c, &empty_dirs, options))
        .collect();

    Some(PodProfile { containers })
}

fn container_profile(
    container: &Container,
    empty_dirs: &HashMap<&str, Option<f64>>,
    options: &ProfileOptions,
) -> ContainerProfile {
    let limit = if options.container_limits {
        container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|limits| limits.get(EPHEMERAL_STORAGE))
            .and_then(quantity_to_f64)
    } else {
        None
    };

    let empty_dir_mounts = if options.volumes {
        container
            .volume_mounts
            .iter()
            .flatten()
            .filter_map(|mount| {
                let size_limit = empty_dirs.get(mount.name.as_str())?;
                Some(EmptyDirMount {
                    volume_name: mount.name.clone(),
                    mount_path: mount.mount_path.clone(),
                    size_limit: *size_limit,
                })
            })
            .collect()
    } else {
        Vec::new()
    };

    ContainerProfile {
        name: container.name.clone(),
        limit,
        empty_dir_mounts,
    }
}

/// Cache of pod profiles shared between watch callbacks and scrape workers
pub struct PodResourceCache {
    options: ProfileOptions,
    profiles: RwLock<HashMap<String, PodProfile>>,
    metrics: Arc<StorageMetrics>,
    ready: ReadySignal,
    logger: StructuredLogger,
}

impl PodResourceCache {
    pub fn new(options: ProfileOptions, metrics: Arc<StorageMetrics>) -> Self {
        Self {
            options,
            profiles: RwLock::new(HashMap::new()),
            metrics,
            ready: ReadySignal::new(),
            logger: StructuredLogger::new("pod_cache"),
        }
    }

    /// Signal fired once the initial listing has been cached
    pub fn ready_signal(&self) -> ReadySignal {
        self.ready.clone()
    }

    /// Profile of a pod, if cached
    pub async fn get(&self, pod_name: &str) -> Option<PodProfile> {
        self.profiles.read().await.get(pod_name).cloned()
    }

    pub async fn contains(&self, pod_name: &str) -> bool {
        self.profiles.read().await.contains_key(pod_name)
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }

    /// Recompute and store the profile of an added or updated pod.
    ///
    /// Pods outside the Running phase keep whatever profile they last had.
    pub async fn apply(&self, pod: &Pod) -> bool {
        let Some(profile) = compute_profile(pod, &self.options) else {
            return false;
        };
        let name = pod.name_any();
        debug!(pod_name = %name, containers = profile.containers.len(), "Caching pod profile");
        self.profiles.write().await.insert(name, profile);
        true
    }

    /// Drop a deleted pod and evict its series by pod and container names
    pub async fn delete(&self, pod: &Pod) {
        let name = pod.name_any();
        let cached = self.profiles.write().await.remove(&name);

        let mut containers: Vec<String> = pod
            .spec
            .as_ref()
            .map(|s| s.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();
        if containers.is_empty() {
            if let Some(profile) = cached {
                containers = profile.container_names();
            }
        }

        let series = self.metrics.evict_pod(&name, &containers);
        self.logger.log_pod_evicted(&name, series, "watch_delete");
    }

    /// Cache every running pod and fire the readiness signal.
    ///
    /// Listing failures are retried; they are never fatal.
    pub async fn initialize(&self, cluster: &dyn ClusterApi) {
        loop {
            match self.try_initialize(cluster).await {
                Ok(count) => {
                    info!(pods = count, "Pod resource cache initialized");
                    break;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_secs = self.options.init_retry_interval.as_secs(),
                        "Initial pod listing failed, retrying"
                    );
                    tokio::time::sleep(self.options.init_retry_interval).await;
                }
            }
        }
        self.ready.mark_ready();
    }

    /// One full listing pass; returns the number of cached profiles
    pub async fn try_initialize(&self, cluster: &dyn ClusterApi) -> Result<usize> {
        let page = cluster.list_pods(None, None).await?;
        for pod in &page.pods {
            self.apply(pod).await;
        }
        Ok(self.len().await)
    }

    /// Apply one watch event
    pub async fn handle_event(&self, event: Event<Pod>) {
        match event {
            Event::Applied(pod) => {
                self.apply(&pod).await;
            }
            Event::Deleted(pod) => self.delete(&pod).await,
            Event::Restarted(pods) => {
                debug!(count = pods.len(), "Pod watch relisted");
                for pod in &pods {
                    self.apply(pod).await;
                }
            }
        }
    }

    /// Follow pod events until the stream ends.
    ///
    /// Transient watch errors are backed off and retried; an ended stream is
    /// returned as an error so the process can exit and be restarted.
    pub async fn watch(&self, api: Api<Pod>) -> Result<()> {
        info!("Starting pod watch");
        let mut stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        while let Some(result) = stream.next().await {
            match result {
                Ok(event) => self.handle_event(event).await,
                Err(e) => warn!(error = %e, "Pod watch error, backing off"),
            }
        }

        anyhow::bail!("pod watch stream terminated")
    }

    /// Remove every cached pod absent from a full paginated listing.
    ///
    /// Nothing is removed unless every page was listed successfully.
    /// Returns `(listed, removed)`.
    pub async fn gc_sweep(&self, cluster: &dyn ClusterApi, batch_size: u32) -> Result<(usize, usize)> {
        let mut listed: HashSet<String> = HashSet::new();
        let mut continue_token = None;
        loop {
            let page = cluster
                .list_pods(Some(batch_size.max(1)), continue_token)
                .await?;
            listed.extend(page.pods.iter().map(|p| p.name_any()));
            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        let stale: Vec<(String, PodProfile)> = {
            let mut profiles = self.profiles.write().await;
            let names: Vec<String> = profiles
                .keys()
                .filter(|name| !listed.contains(*name))
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|name| profiles.remove(&name).map(|p| (name, p)))
                .collect()
        };

        for (name, profile) in &stale {
            info!(pod_name = %name, "Garbage collector removing metrics for deleted pod");
            let series = self.metrics.evict_pod(name, &profile.container_names());
            self.logger.log_pod_evicted(name, series, "gc_sweep");
        }

        Ok((listed.len(), stale.len()))
    }
}
