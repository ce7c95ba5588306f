//! Minimal API server client for the post-start resources.
//!
//! Creation calls are idempotent: a 409 Conflict means the object already
//! exists and is reported as such rather than as an error.

use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};
use crate::pki::read_bootstrap_token;

pub const SYSTEM_NAMESPACES: [&str; 4] = ["kube-system", "kube-public", "kube-node-lease", "default"];

/// Taints removed so workloads can schedule on the single control-plane node.
pub const CONTROL_PLANE_TAINTS: [&str; 3] = [
    "node-role.kubernetes.io/master",
    "node-role.kubernetes.io/control-plane",
    "node.kubernetes.io/not-ready",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    Created,
    AlreadyExists,
}

pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Client that trusts only `ca_pem` and authenticates with `token`.
    pub fn new(base_url: impl Into<String>, ca_pem: &[u8], token: Option<String>) -> Result<Self> {
        let ca = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|e| BootstrapError::Config(format!("invalid CA certificate: {e}")))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BootstrapError::Config(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token,
        })
    }

    /// Client for the local API server using the persisted CA and token.
    pub fn for_config(config: &BootstrapConfig) -> Result<Self> {
        let ca_path = config.pki_dir().join("ca.crt");
        let ca = fs::read(&ca_path).map_err(|e| BootstrapError::io(&ca_path, e))?;
        Self::new(
            config.api_server_url(),
            &ca,
            read_bootstrap_token(&config.token_file()),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.request(method, self.url(path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, path: &str) -> Result<reqwest::Response> {
        request
            .send()
            .await
            .map_err(|e| BootstrapError::Api(format!("{path}: {e}")))
    }

    /// GET `path`, returning the body as JSON. `None` on 404.
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        let response = self.send(self.request(reqwest::Method::GET, path), path).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| BootstrapError::Api(format!("{path}: invalid response body: {e}"))),
            status => Err(api_status_error(path, status, response).await),
        }
    }

    async fn create(&self, path: &str, body: Value) -> Result<Created> {
        let response = self
            .send(self.request(reqwest::Method::POST, path).json(&body), path)
            .await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(Created::AlreadyExists),
            status if status.is_success() => Ok(Created::Created),
            status => Err(api_status_error(path, status, response).await),
        }
    }

    pub async fn ensure_namespace(&self, name: &str) -> Result<Created> {
        let created = self
            .create(
                "/api/v1/namespaces",
                json!({
                    "apiVersion": "v1",
                    "kind": "Namespace",
                    "metadata": { "name": name }
                }),
            )
            .await?;
        log_created("Namespace", name, created);
        Ok(created)
    }

    pub async fn ensure_service_account(&self, namespace: &str, name: &str) -> Result<Created> {
        let created = self
            .create(
                &format!("/api/v1/namespaces/{namespace}/serviceaccounts"),
                json!({
                    "apiVersion": "v1",
                    "kind": "ServiceAccount",
                    "metadata": { "name": name, "namespace": namespace }
                }),
            )
            .await?;
        log_created("ServiceAccount", name, created);
        Ok(created)
    }

    pub async fn ensure_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<Created> {
        let created = self
            .create(
                &format!("/api/v1/namespaces/{namespace}/configmaps"),
                json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": name, "namespace": namespace },
                    "data": data
                }),
            )
            .await?;
        log_created("ConfigMap", name, created);
        Ok(created)
    }

    /// Drop the control-plane taints from `node`. Returns how many were removed.
    pub async fn remove_control_plane_taints(&self, node: &str) -> Result<usize> {
        let path = format!("/api/v1/nodes/{node}");
        let Some(object) = self.get(&path).await? else {
            return Err(BootstrapError::Api(format!("node {node} is not registered")));
        };

        let taints = object["spec"]["taints"].as_array().cloned().unwrap_or_default();
        let (removed, kept) = split_taints(taints);
        if removed == 0 {
            debug!(node, "No control-plane taints present");
            return Ok(0);
        }

        let response = self
            .send(
                self.request(reqwest::Method::PATCH, &path)
                    .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
                    .body(json!({ "spec": { "taints": kept } }).to_string()),
                &path,
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(api_status_error(&path, status, response).await);
        }
        info!(node, removed, "Removed control-plane taints");
        Ok(removed)
    }
}

fn split_taints(taints: Vec<Value>) -> (usize, Vec<Value>) {
    let before = taints.len();
    let kept: Vec<Value> = taints
        .into_iter()
        .filter(|t| {
            let key = t["key"].as_str().unwrap_or_default();
            !CONTROL_PLANE_TAINTS.contains(&key)
        })
        .collect();
    (before - kept.len(), kept)
}

fn log_created(kind: &str, name: &str, created: Created) {
    match created {
        Created::Created => info!("  Created {} '{}'", kind, name),
        Created::AlreadyExists => info!("  {} '{}' already exists", kind, name),
    }
}

async fn api_status_error(path: &str, status: StatusCode, response: reqwest::Response) -> BootstrapError {
    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    BootstrapError::Api(format!("{path}: HTTP {status}: {detail}"))
}
