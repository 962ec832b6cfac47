//! Test doubles and Kubernetes object fixtures

use crate::cluster::{ClusterApi, PodPage};
use crate::models::MonitoredNode;
use crate::stats::{QueryError, StatsSource};
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A ready (or not ready) node with an InternalIP and secure kubelet port
pub fn node(name: &str, ready: bool) -> Node {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {"name": name},
        "status": {
            "conditions": [{
                "type": "Ready",
                "status": if ready { "True" } else { "False" },
                "reason": "KubeletReady"
            }],
            "addresses": [
                {"type": "Hostname", "address": name},
                {"type": "InternalIP", "address": "10.0.0.1"}
            ],
            "daemonEndpoints": {"kubeletEndpoint": {"Port": 10250}}
        }
    }))
    .unwrap()
}

/// A pod from a raw spec fragment
pub fn pod(name: &str, namespace: &str, phase: &str, spec: serde_json::Value) -> Pod {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": namespace},
        "spec": spec,
        "status": {"phase": phase}
    }))
    .unwrap()
}

/// A running pod with one container per (name, optional ephemeral-storage limit)
pub fn running_pod(name: &str, namespace: &str, containers: &[(&str, Option<&str>)]) -> Pod {
    let containers: Vec<serde_json::Value> = containers
        .iter()
        .map(|(container, limit)| match limit {
            Some(limit) => json!({
                "name": container,
                "resources": {"limits": {"ephemeral-storage": limit}}
            }),
            None => json!({"name": container}),
        })
        .collect();
    pod(name, namespace, "Running", json!({"containers": containers}))
}

/// In-memory [`ClusterApi`]
#[derive(Default)]
pub struct FakeCluster {
    nodes: Mutex<Vec<Node>>,
    pods: Mutex<Vec<Pod>>,
    namespaces: Mutex<Vec<String>>,
    failures_remaining: AtomicUsize,
    node_list_calls: AtomicUsize,
    pod_list_calls: AtomicUsize,
}

impl FakeCluster {
    pub fn with_nodes(nodes: Vec<Node>) -> Self {
        let cluster = Self::default();
        cluster.set_nodes(nodes);
        cluster
    }

    pub fn with_pods(pods: Vec<Pod>) -> Self {
        let cluster = Self::default();
        cluster.set_pods(pods);
        cluster
    }

    pub fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.lock().unwrap() = nodes;
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }

    pub fn set_namespaces(&self, namespaces: &[&str]) {
        *self.namespaces.lock().unwrap() = namespaces.iter().map(|s| s.to_string()).collect();
    }

    /// Make the next `n` list calls of any kind fail
    pub fn fail_next_lists(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn node_list_calls(&self) -> usize {
        self.node_list_calls.load(Ordering::SeqCst)
    }

    pub fn pod_list_calls(&self) -> usize {
        self.pod_list_calls.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<()> {
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("injected listing failure");
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.node_list_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name_any() == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node {} not found", name))
    }

    async fn list_pods(
        &self,
        limit: Option<u32>,
        continue_token: Option<String>,
    ) -> Result<PodPage> {
        self.pod_list_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;

        let pods = self.pods.lock().unwrap().clone();
        let start: usize = continue_token
            .as_deref()
            .map(|t| t.parse().unwrap())
            .unwrap_or(0);
        let end = match limit {
            Some(limit) => (start + limit as usize).min(pods.len()),
            None => pods.len(),
        };

        Ok(PodPage {
            pods: pods[start..end].to_vec(),
            continue_token: (end < pods.len()).then(|| end.to_string()),
        })
    }

    async fn list_namespaces(&self, _label_selector: &str) -> Result<Vec<String>> {
        self.maybe_fail()?;
        Ok(self.namespaces.lock().unwrap().clone())
    }
}

/// [`StatsSource`] serving canned payloads per node
#[derive(Default)]
pub struct FakeStatsSource {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    failures_remaining: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeStatsSource {
    pub fn set_payload(&self, node: &str, payload: serde_json::Value) {
        self.payloads
            .lock()
            .unwrap()
            .insert(node.to_string(), payload.to_string().into_bytes());
    }

    /// Fail the next `n` fetches for `node`
    pub fn fail_next(&self, node: &str, n: usize) {
        self.failures_remaining
            .lock()
            .unwrap()
            .insert(node.to_string(), n);
    }

    pub fn calls(&self, node: &str) -> usize {
        self.calls.lock().unwrap().get(node).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl StatsSource for FakeStatsSource {
    async fn fetch(&self, node: &MonitoredNode) -> Result<Vec<u8>, QueryError> {
        *self.calls.lock().unwrap().entry(node.name.clone()).or_insert(0) += 1;

        if let Some(remaining) = self.failures_remaining.lock().unwrap().get_mut(&node.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QueryError::Status {
                    node: node.name.clone(),
                    status: 503,
                });
            }
        }

        self.payloads
            .lock()
            .unwrap()
            .get(&node.name)
            .cloned()
            .ok_or_else(|| QueryError::Status {
                node: node.name.clone(),
                status: 404,
            })
    }
}

/// Stats summary with one pod entry per (pod, namespace, used, available, capacity)
pub fn summary(node: &str, pods: &[(&str, &str, f64, f64, f64)]) -> serde_json::Value {
    let pods: Vec<serde_json::Value> = pods
        .iter()
        .map(|(name, namespace, used, available, capacity)| {
            json!({
                "podRef": {"name": name, "namespace": namespace},
                "ephemeral-storage": {
                    "availableBytes": available,
                    "capacityBytes": capacity,
                    "usedBytes": used
                }
            })
        })
        .collect();
    json!({"node": {"nodeName": node}, "pods": pods})
}

/// A request recorded by [`StubServer`]
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub authorization: Option<String>,
}

#[derive(Clone)]
struct StubState {
    status: StatusCode,
    payload: Arc<Vec<u8>>,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

/// Local HTTP server standing in for a kubelet or the API server.
///
/// Any path ending in `/stats/summary` answers with the payload, or with 503
/// when started through [`StubServer::start_failing`].
pub struct StubServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl StubServer {
    pub async fn start(payload: serde_json::Value) -> Self {
        Self::serve(StatusCode::OK, payload).await
    }

    pub async fn start_failing() -> Self {
        Self::serve(StatusCode::SERVICE_UNAVAILABLE, json!({})).await
    }

    async fn serve(status: StatusCode, payload: serde_json::Value) -> Self {
        let state = StubState {
            status,
            payload: Arc::new(payload.to_string().into_bytes()),
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let seen = state.seen.clone();
        let app = Router::new().fallback(stub_handler).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, seen }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// A kube client whose API server is this stub
    pub fn kube_client(&self) -> kube::Client {
        let uri: http::Uri = self.url().parse().unwrap();
        kube::Client::try_from(kube::Config::new(uri)).unwrap()
    }
}

async fn stub_handler(State(state): State<StubState>, uri: Uri, headers: HeaderMap) -> Response {
    let path = uri.path().to_string();
    state.seen.lock().unwrap().push(SeenRequest {
        path: path.clone(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    if !path.ends_with("/stats/summary") {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.status != StatusCode::OK {
        return (state.status, "kubelet unavailable").into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        state.payload.as_ref().clone(),
    )
        .into_response()
}
