//! Kubernetes API access
//!
//! Listing operations used by initial population, garbage collection and the
//! namespace allow-list sit behind [`ClusterApi`] so they can be faked in tests.
//! Watch streams are consumed directly from `kube::runtime` by their owners.

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

/// One page of a paginated pod listing
#[derive(Debug, Clone, Default)]
pub struct PodPage {
    pub pods: Vec<Pod>,
    /// Token for the next page; `None` on the last page
    pub continue_token: Option<String>,
}

/// Authoritative cluster listings
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every node object
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch a single node object by name
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// List one page of pods across all namespaces
    async fn list_pods(&self, limit: Option<u32>, continue_token: Option<String>)
        -> Result<PodPage>;

    /// Names of namespaces matching a label selector
    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<String>>;
}

/// [`ClusterApi`] backed by the API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .context("Failed to list nodes")?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .with_context(|| format!("Failed to get node {}", name))
    }

    async fn list_pods(
        &self,
        limit: Option<u32>,
        continue_token: Option<String>,
    ) -> Result<PodPage> {
        let mut params = ListParams::default();
        if let Some(limit) = limit {
            params = params.limit(limit);
        }
        if let Some(token) = continue_token.as_deref() {
            params = params.continue_token(token);
        }

        let list = self
            .pods()
            .list(&params)
            .await
            .context("Failed to list pods")?;

        Ok(PodPage {
            pods: list.items,
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
        })
    }

    async fn list_namespaces(&self, label_selector: &str) -> Result<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .with_context(|| format!("Failed to list namespaces matching {}", label_selector))?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }
}
