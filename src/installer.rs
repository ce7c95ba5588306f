use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BootstrapConfig;
use crate::daemon::{capture_diagnostics, DaemonSupervisor};
use crate::error::{BootstrapError, Result};
use crate::kube_api::{KubeClient, SYSTEM_NAMESPACES};
use crate::pipeline::{InstallStep, Pipeline, RunReport};
use crate::pki::{self, Destinations, Issuer};
use crate::provision::Provisioner;
use crate::readiness::{NetworkTransport, ProbeSpec, ProbeTarget, ReadinessProber};
use crate::services::Service;
use crate::templates;
use crate::verify;

/// Pause after launch when readiness probing is disabled.
const READINESS_GRACE: Duration = Duration::from_secs(15);

/// Builds the declared install sequence for one config and runs it.
pub struct Installer<'c> {
    config: &'c BootstrapConfig,
    supervisor: DaemonSupervisor,
    prober: ReadinessProber<NetworkTransport>,
}

impl<'c> Installer<'c> {
    pub fn new(config: &'c BootstrapConfig) -> Result<Self> {
        Ok(Self {
            config,
            supervisor: DaemonSupervisor::new(),
            prober: ReadinessProber::new(NetworkTransport::new()?),
        })
    }

    pub async fn run(&self) -> RunReport {
        let flags = self.config.flags;
        Pipeline::new("install", flags.continue_on_error)
            .with_progress(!flags.verbose)
            .run(self.steps())
            .await
    }

    /// The install sequence. Order is the only dependency mechanism: trust
    /// material is persisted before any service that reads it is launched.
    pub fn steps(&self) -> Vec<InstallStep<'_>> {
        let flags = self.config.flags;
        vec![
            InstallStep::new("Create directories", move || async move { self.create_directories() }),
            InstallStep::new("Download binaries", move || async move {
                Provisioner::new()?.provision_all(self.config).await
            })
            .skip_if(flags.skip_download),
            InstallStep::new("Issue certificates", move || async move { self.issue_certificates() }),
            InstallStep::new("Write configuration", move || async move {
                templates::write_service_configs(self.config).map(|_| ())
            }),
            self.service_step(Service::Etcd),
            self.service_step(Service::ApiServer),
            self.service_step(Service::Containerd),
            InstallStep::new("Configure kubectl", move || async move {
                templates::write_kubeconfigs(self.config).map(|_| ())
            }),
            self.service_step(Service::ControllerManager),
            self.service_step(Service::Scheduler),
            self.service_step(Service::Kubelet),
            InstallStep::new("Create default resources", move || async move {
                self.create_default_resources().await
            })
            .non_critical(),
            InstallStep::new("Verify installation", move || async move { self.verify().await })
                .skip_if(flags.skip_verify),
        ]
    }

    fn service_step(&self, service: Service) -> InstallStep<'_> {
        let step = InstallStep::new(format!("Start {}", service.name()), move || async move {
            self.start_service(service).await
        });
        if service.is_critical() {
            step
        } else {
            step.non_critical()
        }
    }

    fn create_directories(&self) -> Result<()> {
        for dir in self.config.required_dirs() {
            fs::create_dir_all(&dir).map_err(|e| BootstrapError::io(&dir, e))?;
            debug!(path = %dir.display(), "Directory ready");
        }
        Ok(())
    }

    fn issue_certificates(&self) -> Result<()> {
        let bundle = Issuer::new(self.config).issue_bundle()?;
        let report = pki::persist(&bundle, &Destinations::for_config(self.config))?;
        info!(
            files = report.written.len(),
            pki = %self.config.pki_dir().display(),
            "Certificates issued"
        );
        Ok(())
    }

    async fn start_service(&self, service: Service) -> Result<()> {
        if service == Service::Containerd {
            self.remove_stale_socket();
        }

        let handle = self.supervisor.launch(&service.daemon_spec(self.config))?;

        if self.config.flags.skip_readiness_wait {
            warn!(
                "Skipping readiness check for {}, giving it {}s to start",
                service.name(),
                READINESS_GRACE.as_secs()
            );
            tokio::time::sleep(READINESS_GRACE).await;
            return Ok(());
        }

        let credential = match service {
            Service::ApiServer => pki::read_bootstrap_token(&self.config.token_file()),
            _ => None,
        };
        let spec = service.probe_spec(self.config, credential)?;
        if let Err(e) = self.prober.await_ready(&spec).await {
            if matches!(e, BootstrapError::ReadinessTimeout { .. }) {
                capture_diagnostics(&handle).log();
            }
            return Err(e);
        }

        if service == Service::Kubelet {
            self.await_node_registration().await?;
        }
        Ok(())
    }

    fn remove_stale_socket(&self) {
        let socket = &self.config.containerd_socket;
        match fs::remove_file(socket) {
            Ok(()) => debug!(path = %socket.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %socket.display(), error = %e, "Failed to remove stale socket"),
        }
    }

    /// Wait for the node object, then clear the control-plane taints.
    async fn await_node_registration(&self) -> Result<()> {
        let node = &self.config.node_name;
        let url = format!("{}/api/v1/nodes/{}", self.config.api_server_url(), node);
        let spec = ProbeSpec::new(
            format!("node {node} registration"),
            vec![ProbeTarget::Http(url)],
            1,
            60,
        )?
        .with_interval(Duration::from_secs(3))
        .with_credential(pki::read_bootstrap_token(&self.config.token_file()))
        .with_log_hint(self.config.log_file(Service::Kubelet.name()));
        self.prober.await_ready(&spec).await?;

        let untainted = match KubeClient::for_config(self.config) {
            Ok(client) => client.remove_control_plane_taints(node).await,
            Err(e) => Err(e),
        };
        if let Err(e) = untainted {
            warn!(node = %node, error = %e, "Could not remove control-plane taints");
        }
        Ok(())
    }

    async fn create_default_resources(&self) -> Result<()> {
        let client = KubeClient::for_config(self.config)?;
        let mut failures = Vec::new();

        for ns in SYSTEM_NAMESPACES {
            if let Err(e) = client.ensure_namespace(ns).await {
                warn!(namespace = ns, error = %e, "Failed to create namespace");
                failures.push(format!("namespace {ns}"));
            }
        }

        if let Err(e) = client.ensure_service_account("default", "default").await {
            warn!(error = %e, "Failed to create default service account");
            failures.push("serviceaccount default/default".to_string());
        }

        let ca_path = self.config.pki_dir().join("ca.crt");
        let ca = fs::read_to_string(&ca_path).map_err(|e| BootstrapError::io(&ca_path, e))?;
        let data = BTreeMap::from([("ca.crt".to_string(), ca)]);
        if let Err(e) = client
            .ensure_config_map("default", "kube-root-ca.crt", data)
            .await
        {
            warn!(error = %e, "Failed to create kube-root-ca.crt config map");
            failures.push("configmap default/kube-root-ca.crt".to_string());
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(BootstrapError::Api(format!(
                "could not create: {}",
                failures.join(", ")
            )))
        }
    }

    async fn verify(&self) -> Result<()> {
        let credential = pki::read_bootstrap_token(&self.config.token_file());
        let report = verify::run_checks(
            &self.prober,
            verify::default_checks(self.config),
            credential,
        )
        .await;
        verify::into_result(report)
    }
}
