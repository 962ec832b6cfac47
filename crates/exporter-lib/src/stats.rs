//! Node stats query
//!
//! Fetches a node's raw `/stats/summary` payload either through the API
//! server's node proxy or directly from the kubelet, and wraps any source in
//! a bounded exponential-backoff retry whose budget is one sample interval.

use crate::models::MonitoredNode;
use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Failure of a single stats query attempt, or of the whole retry budget
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("transport error querying node {node}: {message}")]
    Transport { node: String, message: String },

    #[error("node {node} answered with HTTP {status}")]
    Status { node: String, status: u16 },

    #[error("node {node} has no resolved kubelet endpoint")]
    NoEndpoint { node: String },

    #[error("stats query for node {node} gave up after {attempts} attempts: {last}")]
    Exhausted {
        node: String,
        attempts: u32,
        #[source]
        last: Box<QueryError>,
    },
}

impl QueryError {
    fn transport(node: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            node: node.to_string(),
            message: err.to_string(),
        }
    }
}

/// Anything that can produce one node's raw stats payload
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn fetch(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError>;
}

#[async_trait]
impl<T: StatsSource + ?Sized> StatsSource for Arc<T> {
    async fn fetch(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError> {
        self.as_ref().fetch(node).await
    }
}

/// Direct kubelet client configuration
#[derive(Debug, Clone)]
pub struct KubeletClientConfig {
    pub insecure_skip_tls_verify: bool,
    pub token_path: PathBuf,
    pub ca_path: PathBuf,
    pub request_timeout: Duration,
}

impl Default for KubeletClientConfig {
    fn default() -> Self {
        Self {
            insecure_skip_tls_verify: false,
            token_path: PathBuf::from(SERVICE_ACCOUNT_TOKEN),
            ca_path: PathBuf::from(SERVICE_ACCOUNT_CA),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Queries `<endpoint>/stats/summary` on the kubelet.
///
/// `http://` endpoints (the read-only port) are queried anonymously; `https://`
/// endpoints carry the service-account bearer token, which is re-read on every
/// request so token rotation is picked up.
pub struct KubeletClient {
    http: reqwest::Client,
    token_path: PathBuf,
}

impl KubeletClient {
    pub async fn new(config: KubeletClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if !config.insecure_skip_tls_verify {
            match tokio::fs::read(&config.ca_path).await {
                Ok(pem) => {
                    let ca = reqwest::Certificate::from_pem(&pem).with_context(|| {
                        format!("Invalid CA bundle at {}", config.ca_path.display())
                    })?;
                    builder = builder.add_root_certificate(ca);
                }
                Err(e) => debug!(
                    path = %config.ca_path.display(),
                    error = %e,
                    "Service-account CA not readable, using the bundled webpki roots"
                ),
            }
        }

        let http = builder.build().context("Failed to build kubelet HTTP client")?;
        Ok(Self {
            http,
            token_path: config.token_path,
        })
    }

    /// Current service-account token, trimmed
    pub async fn bearer_token(&self) -> std::io::Result<String> {
        let token = tokio::fs::read_to_string(&self.token_path).await?;
        Ok(token.trim().to_string())
    }
}

impl KubeletClient {
    /// Build the summary request for a node; only `https://` endpoints get the
    /// bearer token
    pub async fn summary_request(&self, node: &MonitoredNode) -> Result<reqwest::Request, QueryError> {
        let endpoint = node.endpoint.as_deref().ok_or_else(|| QueryError::NoEndpoint {
            node: node.name.clone(),
        })?;
        let url = format!("{}/stats/summary", endpoint.trim_end_matches('/'));

        let mut request = self.http.get(&url);
        if endpoint.starts_with("https://") {
            let token = self
                .bearer_token()
                .await
                .map_err(|e| QueryError::transport(&node.name, e))?;
            request = request.bearer_auth(token);
        }

        request
            .build()
            .map_err(|e| QueryError::transport(&node.name, e))
    }
}

#[async_trait]
impl StatsSource for KubeletClient {
    async fn fetch(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError> {
        let request = self.summary_request(node).await?;

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| QueryError::transport(&node.name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryError::Status {
                node: node.name.clone(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| QueryError::transport(&node.name, e))?;
        Ok(body.to_vec())
    }
}

/// Routes each query to the kubelet when the node has a resolved endpoint,
/// and through the API server's node proxy otherwise
pub struct ClusterStatsSource {
    client: kube::Client,
    kubelet: Option<KubeletClient>,
}

impl ClusterStatsSource {
    pub fn new(client: kube::Client, kubelet: Option<KubeletClient>) -> Self {
        Self { client, kubelet }
    }

    async fn fetch_via_proxy(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError> {
        let path = format!("/api/v1/nodes/{}/proxy/stats/summary", node.name);
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| QueryError::transport(&node.name, e))?;

        match self.client.request_text(request).await {
            Ok(text) => Ok(text.into_bytes()),
            Err(kube::Error::Api(response)) => Err(QueryError::Status {
                node: node.name.clone(),
                status: response.code,
            }),
            Err(e) => Err(QueryError::transport(&node.name, e)),
        }
    }
}

#[async_trait]
impl StatsSource for ClusterStatsSource {
    async fn fetch(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError> {
        match (&self.kubelet, &node.endpoint) {
            (Some(kubelet), Some(_)) => kubelet.fetch(node).await,
            _ => self.fetch_via_proxy(node).await,
        }
    }
}

/// Backoff shape for one node query
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    /// Ceiling for a single wait between attempts
    pub max_interval: Duration,
    /// Total budget; reaching it is a terminal failure
    pub max_elapsed: Duration,
}

impl RetryPolicy {
    /// Policy whose total budget is one sample interval
    pub fn for_interval(sample_interval: Duration) -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            max_elapsed: sample_interval,
        }
    }
}

/// Retrying wrapper around a [`StatsSource`]
pub struct NodeStatsQuery<S> {
    source: S,
    policy: RetryPolicy,
}

impl<S: StatsSource> NodeStatsQuery<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch a node's payload, retrying every failure until the budget runs out
    pub async fn query(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.initial_interval)
            .with_max_interval(self.policy.max_interval)
            .with_max_elapsed_time(Some(self.policy.max_elapsed))
            .build();
        let attempts = AtomicU32::new(0);

        let result = backoff::future::retry_notify(
            backoff,
            || async {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.source
                    .fetch(node)
                    .await
                    .map_err(backoff::Error::transient)
            },
            |err: QueryError, wait: Duration| {
                debug!(
                    node_name = %node.name,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Stats query attempt failed"
                );
            },
        )
        .await;

        result.map_err(|last| QueryError::Exhausted {
            node: node.name.clone(),
            attempts: attempts.load(Ordering::Relaxed),
            last: Box::new(last),
        })
    }
}
