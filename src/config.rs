use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};

use crate::clienv::{self, EnvOverrides};
use crate::error::{BootstrapError, Result};

pub const DEFAULT_K8S_VERSION: &str = "v1.30.0";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Versions of the binaries fetched by the provisioning step.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComponentVersions {
    pub containerd: String,
    pub runc: String,
    pub cni_plugins: String,
    pub kubebuilder_tools: String,
    pub crictl: String,
}

impl Default for ComponentVersions {
    fn default() -> Self {
        Self {
            containerd: "2.0.5".to_string(),
            runc: "v1.2.6".to_string(),
            cni_plugins: "v1.6.2".to_string(),
            kubebuilder_tools: "1.30.0".to_string(),
            crictl: "v1.30.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PkiSettings {
    pub root_validity_days: u32,
    pub leaf_validity_days: u32,
}

impl Default for PkiSettings {
    fn default() -> Self {
        Self {
            root_validity_days: 3650,
            leaf_validity_days: 365,
        }
    }
}

/// Run-level switches, normally populated from CLI flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
    pub skip_download: bool,
    pub skip_verify: bool,
    pub skip_readiness_wait: bool,
    pub continue_on_error: bool,
    pub verbose: bool,
}

/// On-disk form of the configuration. Every field is optional so that
/// environment overrides and detection only fill what the file leaves out.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    k8s_version: Option<String>,
    versions: Option<ComponentVersions>,
    pki: Option<PkiSettings>,
    base_dir: Option<PathBuf>,
    kubelet_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    cni_conf_dir: Option<PathBuf>,
    cni_bin_dir: Option<PathBuf>,
    containerd_config: Option<PathBuf>,
    containerd_socket: Option<PathBuf>,
    admin_kubeconfig: Option<PathBuf>,
    host_ip: Option<IpAddr>,
    node_name: Option<String>,
    service_cidr: Option<String>,
    cluster_dns: Option<String>,
    pod_subnet: Option<String>,
}

/// Every path and tunable the installer uses. Built once at startup and
/// passed by reference into each component.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub k8s_version: String,
    pub versions: ComponentVersions,
    pub pki: PkiSettings,
    pub base_dir: PathBuf,
    pub kubelet_dir: PathBuf,
    pub log_dir: PathBuf,
    pub cni_conf_dir: PathBuf,
    pub cni_bin_dir: PathBuf,
    pub containerd_config: PathBuf,
    pub containerd_socket: PathBuf,
    pub admin_kubeconfig: PathBuf,
    pub host_ip: IpAddr,
    pub node_name: String,
    pub service_cidr: String,
    pub cluster_dns: String,
    pub pod_subnet: String,
    /// `PATH` handed to launched services.
    pub search_path: String,
    pub flags: RunFlags,
}

impl BootstrapConfig {
    /// Defaults, then the optional TOML file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        Ok(Self::assemble(file, clienv::overrides(), detect_host_ip, clienv::hostname))
    }

    fn assemble(
        file: ConfigFile,
        env: EnvOverrides,
        detect_ip: impl FnOnce() -> IpAddr,
        detect_hostname: impl FnOnce() -> String,
    ) -> Self {
        let base_dir = env
            .base_dir
            .or(file.base_dir)
            .unwrap_or_else(|| PathBuf::from("/var/lib/kubernetes"));

        let host_ip = env
            .host_ip
            .and_then(|raw| match raw.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(value = %raw, "Ignoring unparseable K8S_HOST_IP");
                    None
                }
            })
            .or(file.host_ip)
            .unwrap_or_else(detect_ip);

        let node_name = env
            .node_name
            .or(file.node_name)
            .unwrap_or_else(detect_hostname);

        let cni_bin_dir = file
            .cni_bin_dir
            .unwrap_or_else(|| PathBuf::from("/opt/cni/bin"));
        let search_path = format!(
            "{}:{}:{}:/usr/local/bin:/usr/sbin",
            env.path.as_deref().unwrap_or(DEFAULT_PATH),
            base_dir.join("bin").display(),
            cni_bin_dir.display()
        );

        Self {
            k8s_version: file
                .k8s_version
                .unwrap_or_else(|| DEFAULT_K8S_VERSION.to_string()),
            versions: file.versions.unwrap_or_default(),
            pki: file.pki.unwrap_or_default(),
            base_dir,
            kubelet_dir: env
                .kubelet_dir
                .or(file.kubelet_dir)
                .unwrap_or_else(|| PathBuf::from("/var/lib/kubelet")),
            log_dir: env
                .log_dir
                .or(file.log_dir)
                .unwrap_or_else(|| PathBuf::from("/var/log/kubernetes")),
            cni_conf_dir: file
                .cni_conf_dir
                .unwrap_or_else(|| PathBuf::from("/etc/cni/net.d")),
            cni_bin_dir,
            containerd_config: file
                .containerd_config
                .unwrap_or_else(|| PathBuf::from("/etc/containerd/config.toml")),
            containerd_socket: file
                .containerd_socket
                .unwrap_or_else(|| PathBuf::from("/run/containerd/containerd.sock")),
            admin_kubeconfig: file
                .admin_kubeconfig
                .unwrap_or_else(|| clienv::home_dir().join(".kube").join("config")),
            host_ip,
            node_name,
            service_cidr: file
                .service_cidr
                .unwrap_or_else(|| "10.0.0.0/24".to_string()),
            cluster_dns: file.cluster_dns.unwrap_or_else(|| "10.0.0.10".to_string()),
            pod_subnet: file
                .pod_subnet
                .unwrap_or_else(|| "10.22.0.0/16".to_string()),
            search_path,
            flags: RunFlags::default(),
        }
    }

    /// Defaults rooted under `root`, with loopback networking. Used by tests and
    /// by `certs` runs that should not touch system paths.
    pub fn rooted_at(root: &Path) -> Self {
        let file = ConfigFile {
            base_dir: Some(root.join("kubernetes")),
            kubelet_dir: Some(root.join("kubelet")),
            log_dir: Some(root.join("log")),
            cni_conf_dir: Some(root.join("cni").join("net.d")),
            cni_bin_dir: Some(root.join("cni").join("bin")),
            containerd_config: Some(root.join("containerd").join("config.toml")),
            containerd_socket: Some(root.join("containerd").join("containerd.sock")),
            admin_kubeconfig: Some(root.join("kube").join("config")),
            ..ConfigFile::default()
        };
        Self::assemble(
            file,
            EnvOverrides::default(),
            || IpAddr::V4(Ipv4Addr::LOCALHOST),
            || "localhost".to_string(),
        )
    }

    pub fn with_flags(mut self, flags: RunFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn pki_dir(&self) -> PathBuf {
        self.base_dir.join("pki")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.base_dir.join("bin")
    }

    pub fn bin(&self, name: &str) -> PathBuf {
        self.bin_dir().join(name)
    }

    pub fn etcd_data_dir(&self) -> PathBuf {
        self.base_dir.join("etcd")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.base_dir.join("manifests")
    }

    pub fn log_file(&self, service: &str) -> PathBuf {
        self.log_dir.join(format!("{service}.log"))
    }

    pub fn token_file(&self) -> PathBuf {
        self.pki_dir().join("token.csv")
    }

    pub fn kubelet_kubeconfig(&self) -> PathBuf {
        self.kubelet_dir.join("kubeconfig")
    }

    pub fn kubelet_config(&self) -> PathBuf {
        self.kubelet_dir.join("config.yaml")
    }

    /// Directories that must exist before any other step runs.
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![
            self.base_dir.clone(),
            self.bin_dir(),
            self.pki_dir(),
            self.etcd_data_dir(),
            self.manifests_dir(),
            self.kubelet_dir.clone(),
            self.kubelet_dir.join("pki"),
            self.log_dir.clone(),
            self.cni_conf_dir.clone(),
            self.cni_bin_dir.clone(),
        ];
        for path in [&self.containerd_config, &self.containerd_socket, &self.admin_kubeconfig] {
            if let Some(parent) = path.parent() {
                dirs.push(parent.to_path_buf());
            }
        }
        dirs
    }

    pub fn api_server_url(&self) -> String {
        "https://127.0.0.1:6443".to_string()
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    tracing::trace!(path = %path.display(), "Loading config file");
    let content = fs::read_to_string(path).map_err(|e| BootstrapError::io(path, e))?;
    toml::from_str(&content).map_err(|e| {
        BootstrapError::Config(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Address of the interface carrying the default route. Connecting a UDP
/// socket sends nothing; it only asks the kernel to pick a source address.
fn detect_host_ip() -> IpAddr {
    let detected = UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified());

    match detected {
        Some(ip) => {
            tracing::debug!(ip = %ip, "Detected host IP");
            ip
        }
        None => {
            tracing::warn!("Could not detect a non-loopback host IP, using 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn defaults_use_canonical_paths() {
        let config = BootstrapConfig::assemble(
            ConfigFile::default(),
            EnvOverrides::default(),
            loopback,
            || "node-a".to_string(),
        );
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/kubernetes"));
        assert_eq!(config.pki_dir(), PathBuf::from("/var/lib/kubernetes/pki"));
        assert_eq!(
            config.log_file("etcd"),
            PathBuf::from("/var/log/kubernetes/etcd.log")
        );
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.k8s_version, DEFAULT_K8S_VERSION);
        assert_eq!(config.pki.root_validity_days, 3650);
    }

    #[test]
    fn env_overrides_beat_file_values() {
        let file: ConfigFile = toml::from_str(
            r#"
            base_dir = "/srv/k8s"
            host_ip = "10.1.2.3"
            node_name = "from-file"
            "#,
        )
        .unwrap();
        let env = EnvOverrides {
            base_dir: Some(PathBuf::from("/opt/k8s")),
            host_ip: Some("192.168.0.7".to_string()),
            ..EnvOverrides::default()
        };

        let config = BootstrapConfig::assemble(file, env, loopback, || "unused".to_string());

        assert_eq!(config.base_dir, PathBuf::from("/opt/k8s"));
        assert_eq!(config.host_ip, "192.168.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(config.node_name, "from-file");
    }

    #[test]
    fn bad_env_host_ip_falls_back_to_file() {
        let file = ConfigFile {
            host_ip: Some("10.9.9.9".parse().unwrap()),
            ..ConfigFile::default()
        };
        let env = EnvOverrides {
            host_ip: Some("not-an-ip".to_string()),
            ..EnvOverrides::default()
        };
        let config = BootstrapConfig::assemble(file, env, loopback, || "n".to_string());
        assert_eq!(config.host_ip, "10.9.9.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubestrap.toml");
        fs::write(
            &path,
            r#"
            k8s_version = "v1.31.2"
            host_ip = "127.0.0.1"
            node_name = "test-node"

            [pki]
            root_validity_days = 365
            leaf_validity_days = 30
            "#,
        )
        .unwrap();

        let config = BootstrapConfig::load(Some(&path)).unwrap();
        assert_eq!(config.k8s_version, "v1.31.2");
        assert_eq!(config.pki.leaf_validity_days, 30);
        assert_eq!(config.versions.containerd, "2.0.5");
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "base_dir = [").unwrap();
        let err = BootstrapConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
    }

    #[test]
    fn rooted_config_stays_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = BootstrapConfig::rooted_at(dir.path());
        for path in config.required_dirs() {
            assert!(path.starts_with(dir.path()), "{} escapes root", path.display());
        }
    }
}
