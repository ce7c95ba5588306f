//! Catalog of the control-plane services: how each one is launched and how
//! its readiness is judged.

use std::net::IpAddr;
use std::time::Duration;

use crate::config::BootstrapConfig;
use crate::daemon::DaemonSpec;
use crate::error::Result;
use crate::readiness::{ProbeSpec, ProbeTarget};

pub const API_SERVER_PORT: u16 = 6443;
pub const ETCD_CLIENT_PORT: u16 = 2379;
pub const ETCD_PEER_PORT: u16 = 2380;
pub const CONTROLLER_MANAGER_PORT: u16 = 10257;
pub const SCHEDULER_PORT: u16 = 10259;
pub const KUBELET_HEALTHZ_PORT: u16 = 10248;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Etcd,
    ApiServer,
    Containerd,
    ControllerManager,
    Scheduler,
    Kubelet,
}

impl Service {
    /// Launch order.
    pub const ALL: [Service; 6] = [
        Service::Etcd,
        Service::ApiServer,
        Service::Containerd,
        Service::ControllerManager,
        Service::Scheduler,
        Service::Kubelet,
    ];

    /// Short name, also the log file stem.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::ApiServer => "apiserver",
            Self::Containerd => "containerd",
            Self::ControllerManager => "controller-manager",
            Self::Scheduler => "scheduler",
            Self::Kubelet => "kubelet",
        }
    }

    pub fn binary(&self) -> &'static str {
        match self {
            Self::Etcd => "etcd",
            Self::ApiServer => "kube-apiserver",
            Self::Containerd => "containerd",
            Self::ControllerManager => "kube-controller-manager",
            Self::Scheduler => "kube-scheduler",
            Self::Kubelet => "kubelet",
        }
    }

    /// Controller-manager and scheduler failures do not stop the install.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Self::ControllerManager | Self::Scheduler)
    }

    pub fn daemon_spec(&self, config: &BootstrapConfig) -> DaemonSpec {
        let spec = DaemonSpec::new(
            self.name(),
            config.bin(self.binary()),
            config.log_file(self.name()),
        );
        match self {
            Self::Etcd => spec.args(etcd_args(config)),
            Self::ApiServer => spec.args(api_server_args(config)),
            Self::Containerd => spec
                .arg("-c")
                .arg(config.containerd_config.display().to_string())
                .args(["--log-level", "info"])
                .env("PATH", &config.search_path)
                .env("CONTAINERD_NAMESPACE", "k8s.io"),
            Self::ControllerManager => spec.args(controller_manager_args(config)),
            Self::Scheduler => spec.args([
                format!("--kubeconfig={}", config.admin_kubeconfig.display()),
                "--leader-elect=false".to_string(),
                "--bind-address=127.0.0.1".to_string(),
                "--v=2".to_string(),
            ]),
            Self::Kubelet => spec
                .args(kubelet_args(config))
                .env("PATH", &config.search_path),
        }
    }

    /// Readiness policy. `credential` is only used by the API server probe.
    pub fn probe_spec(&self, config: &BootstrapConfig, credential: Option<String>) -> Result<ProbeSpec> {
        let log = config.log_file(self.name());
        let spec = match self {
            Self::Etcd => {
                let mut targets = vec![http(format!("http://127.0.0.1:{ETCD_CLIENT_PORT}/health"))];
                if !config.host_ip.is_loopback() {
                    targets.push(http(format!(
                        "http://{}/health",
                        host_port(config.host_ip, ETCD_CLIENT_PORT)
                    )));
                }
                ProbeSpec::new("etcd", targets, 1, 30)?
                    .with_interval(Duration::from_secs(1))
                    .with_timeout(Duration::from_secs(2))
            }
            Self::ApiServer => {
                let mut targets = vec![http(format!("https://127.0.0.1:{API_SERVER_PORT}/readyz"))];
                if !config.host_ip.is_loopback() {
                    targets.push(http(format!(
                        "https://{}/readyz",
                        host_port(config.host_ip, API_SERVER_PORT)
                    )));
                }
                targets.push(http(format!("https://127.0.0.1:{API_SERVER_PORT}/livez")));
                ProbeSpec::new("kube-apiserver", targets, 3, 300)?
                    .with_interval(Duration::from_secs(2))
                    .with_timeout(Duration::from_secs(5))
                    .with_credential(credential)
            }
            Self::Containerd => ProbeSpec::new(
                "containerd",
                vec![ProbeTarget::Unix(config.containerd_socket.clone())],
                2,
                120,
            )?
            .with_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(2)),
            Self::ControllerManager => ProbeSpec::new(
                "kube-controller-manager",
                vec![http(format!("https://127.0.0.1:{CONTROLLER_MANAGER_PORT}/healthz"))],
                1,
                30,
            )?
            .with_interval(Duration::from_secs(2)),
            Self::Scheduler => ProbeSpec::new(
                "kube-scheduler",
                vec![http(format!("https://127.0.0.1:{SCHEDULER_PORT}/healthz"))],
                1,
                30,
            )?
            .with_interval(Duration::from_secs(2)),
            Self::Kubelet => ProbeSpec::new(
                "kubelet",
                vec![http(format!("http://127.0.0.1:{KUBELET_HEALTHZ_PORT}/healthz"))],
                1,
                60,
            )?
            .with_interval(Duration::from_secs(2)),
        };
        Ok(spec.with_log_hint(log))
    }
}

fn http(url: String) -> ProbeTarget {
    ProbeTarget::Http(url)
}

fn host_port(ip: IpAddr, port: u16) -> String {
    std::net::SocketAddr::new(ip, port).to_string()
}

fn etcd_args(config: &BootstrapConfig) -> Vec<String> {
    let client = host_port(config.host_ip, ETCD_CLIENT_PORT);
    let peer = host_port(config.host_ip, ETCD_PEER_PORT);
    vec![
        format!("--data-dir={}", config.etcd_data_dir().display()),
        format!("--advertise-client-urls=http://{client}"),
        format!("--listen-client-urls=http://0.0.0.0:{ETCD_CLIENT_PORT}"),
        format!("--listen-peer-urls=http://0.0.0.0:{ETCD_PEER_PORT}"),
        format!("--initial-cluster=default=http://{peer}"),
        format!("--initial-advertise-peer-urls=http://{peer}"),
        "--initial-cluster-state=new".to_string(),
        "--initial-cluster-token=kubestrap".to_string(),
    ]
}

fn api_server_args(config: &BootstrapConfig) -> Vec<String> {
    let pki = config.pki_dir();
    vec![
        format!("--etcd-servers=http://127.0.0.1:{ETCD_CLIENT_PORT}"),
        format!("--service-cluster-ip-range={}", config.service_cidr),
        "--bind-address=0.0.0.0".to_string(),
        format!("--secure-port={API_SERVER_PORT}"),
        format!("--advertise-address={}", config.host_ip),
        "--authorization-mode=AlwaysAllow".to_string(),
        "--anonymous-auth=false".to_string(),
        format!("--client-ca-file={}", pki.join("ca.crt").display()),
        format!("--tls-cert-file={}", pki.join("apiserver.crt").display()),
        format!("--tls-private-key-file={}", pki.join("apiserver.key").display()),
        format!("--service-account-key-file={}", pki.join("sa.pub").display()),
        format!(
            "--service-account-signing-key-file={}",
            pki.join("sa.key").display()
        ),
        format!("--token-auth-file={}", config.token_file().display()),
        "--service-account-issuer=https://kubernetes.default.svc.cluster.local".to_string(),
        "--enable-priority-and-fairness=false".to_string(),
        "--allow-privileged=true".to_string(),
        "--profiling=false".to_string(),
        "--storage-backend=etcd3".to_string(),
        "--storage-media-type=application/json".to_string(),
        "--v=2".to_string(),
    ]
}

fn controller_manager_args(config: &BootstrapConfig) -> Vec<String> {
    let pki = config.pki_dir();
    vec![
        format!("--kubeconfig={}", config.admin_kubeconfig.display()),
        "--leader-elect=false".to_string(),
        format!("--service-cluster-ip-range={}", config.service_cidr),
        "--cluster-name=kubernetes".to_string(),
        format!("--root-ca-file={}", pki.join("ca.crt").display()),
        format!(
            "--service-account-private-key-file={}",
            pki.join("sa.key").display()
        ),
        "--use-service-account-credentials=true".to_string(),
        "--v=2".to_string(),
    ]
}

fn kubelet_args(config: &BootstrapConfig) -> Vec<String> {
    vec![
        format!("--kubeconfig={}", config.kubelet_kubeconfig().display()),
        format!("--config={}", config.kubelet_config().display()),
        format!("--root-dir={}", config.kubelet_dir.display()),
        format!("--cert-dir={}", config.kubelet_dir.join("pki").display()),
        format!("--hostname-override={}", config.node_name),
        format!("--node-ip={}", config.host_ip),
        "--max-pods=110".to_string(),
        "--v=2".to_string(),
    ]
}
