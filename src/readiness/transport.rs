use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

use super::{ProbeOutcome, ProbeTarget};
use crate::error::{BootstrapError, Result};

/// Performs a single request against a probe target.
///
/// Timeouts are enforced by the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn attempt(&self, target: &ProbeTarget, credential: Option<&str>) -> ProbeOutcome;
}

/// Real network transport: TCP connect, HTTPS GET, unix socket connect.
pub struct NetworkTransport {
    http: reqwest::Client,
}

impl NetworkTransport {
    /// Accepts any server certificate. Used before the cluster CA exists,
    /// or for endpoints that only expose self-signed serving certs.
    pub fn new() -> Result<Self> {
        let http = base_client()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| BootstrapError::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Validates server certificates against `ca_pem`.
    pub fn trusting(ca_pem: &[u8]) -> Result<Self> {
        let ca = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|e| BootstrapError::Config(format!("invalid CA certificate: {e}")))?;
        let http = base_client()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| BootstrapError::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    async fn http_get(&self, url: &str, credential: Option<&str>) -> ProbeOutcome {
        let mut request = self.http.get(url);
        if let Some(token) = credential {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                trace!(url, status = status.as_u16(), "Probe response");
                if status.is_success() {
                    ProbeOutcome::Ready
                } else if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    ProbeOutcome::Unauthorized(status.as_u16())
                } else {
                    ProbeOutcome::NotReady(format!("HTTP {status}"))
                }
            }
            Err(e) => ProbeOutcome::NotReady(e.to_string()),
        }
    }
}

fn base_client() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .no_proxy()
        .connect_timeout(Duration::from_secs(5))
        .user_agent(concat!("kubestrap/", env!("CARGO_PKG_VERSION")))
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn attempt(&self, target: &ProbeTarget, credential: Option<&str>) -> ProbeOutcome {
        match target {
            ProbeTarget::Tcp(addr) => match tokio::net::TcpStream::connect(addr.as_str()).await {
                Ok(_) => ProbeOutcome::Ready,
                Err(e) => ProbeOutcome::NotReady(e.to_string()),
            },
            ProbeTarget::Http(url) => self.http_get(url, credential).await,
            #[cfg(unix)]
            ProbeTarget::Unix(path) => match tokio::net::UnixStream::connect(path).await {
                Ok(_) => ProbeOutcome::Ready,
                Err(e) => ProbeOutcome::NotReady(e.to_string()),
            },
            #[cfg(not(unix))]
            ProbeTarget::Unix(_) => {
                ProbeOutcome::NotReady("unix sockets are not supported here".into())
            }
        }
    }
}
