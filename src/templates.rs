//! Fixed-content configuration files written before the services start.

use serde::Serialize;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};
use crate::services::API_SERVER_PORT;

const CNI_CONF_NAME: &str = "10-kubestrap.conf";
const CLUSTER_NAME: &str = "kubestrap";

/// CNI bridge network for pods.
pub fn cni_config(config: &BootstrapConfig) -> serde_json::Value {
    json!({
        "cniVersion": "0.3.1",
        "name": CLUSTER_NAME,
        "type": "bridge",
        "bridge": "cni0",
        "isGateway": true,
        "ipMasq": true,
        "ipam": {
            "type": "host-local",
            "subnet": config.pod_subnet,
            "routes": [{ "dst": "0.0.0.0/0" }]
        }
    })
}

pub fn containerd_config(config: &BootstrapConfig) -> String {
    format!(
        r#"version = 3

[grpc]
address = "{socket}"

[plugins.'io.containerd.cri.v1.runtime']
enable_selinux = false
enable_unprivileged_ports = true
enable_unprivileged_icmp = true
device_ownership_from_security_context = false

[plugins.'io.containerd.cri.v1.images']
snapshotter = "native"
disable_snapshot_annotations = true

[plugins.'io.containerd.cri.v1.runtime'.cni]
bin_dir = "{cni_bin}"
conf_dir = "{cni_conf}"

[plugins.'io.containerd.cri.v1.runtime'.containerd.runtimes.runc]
runtime_type = "io.containerd.runc.v2"

[plugins.'io.containerd.cri.v1.runtime'.containerd.runtimes.runc.options]
SystemdCgroup = false
"#,
        socket = config.containerd_socket.display(),
        cni_bin = config.cni_bin_dir.display(),
        cni_conf = config.cni_conf_dir.display(),
    )
}

pub fn kubelet_config(config: &BootstrapConfig) -> String {
    format!(
        r#"apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
authentication:
  anonymous:
    enabled: false
  webhook:
    enabled: true
  x509:
    clientCAFile: "{client_ca}"
authorization:
  mode: AlwaysAllow
cgroupDriver: cgroupfs
clusterDomain: "cluster.local"
clusterDNS:
  - "{dns}"
resolvConf: "/etc/resolv.conf"
runtimeRequestTimeout: "15m"
failSwapOn: false
serverTLSBootstrap: false
containerRuntimeEndpoint: "unix://{socket}"
staticPodPath: "{manifests}"
healthzBindAddress: "127.0.0.1"
healthzPort: 10248
"#,
        client_ca = config.kubelet_dir.join("ca.crt").display(),
        dns = config.cluster_dns,
        socket = config.containerd_socket.display(),
        manifests = config.manifests_dir().display(),
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<Cluster>>,
    users: Vec<Named<User>>,
    contexts: Vec<Named<Context>>,
    current_context: String,
}

#[derive(Debug, Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    inner: T,
}

#[derive(Debug, Serialize)]
struct Cluster {
    cluster: ClusterEntry,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: PathBuf,
}

#[derive(Debug, Serialize)]
struct User {
    user: UserEntry,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    client_certificate: PathBuf,
    client_key: PathBuf,
}

#[derive(Debug, Serialize)]
struct Context {
    context: ContextEntry,
}

#[derive(Debug, Serialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

/// Kubeconfig that authenticates with the admin client certificate.
/// Rendered as JSON, which kubectl and the components accept.
pub fn admin_kubeconfig(config: &BootstrapConfig) -> Result<String> {
    let pki = config.pki_dir();
    let context = format!("admin@{CLUSTER_NAME}");
    let doc = Kubeconfig {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name: CLUSTER_NAME.to_string(),
            inner: Cluster {
                cluster: ClusterEntry {
                    server: format!("https://127.0.0.1:{API_SERVER_PORT}"),
                    certificate_authority: pki.join("ca.crt"),
                },
            },
        }],
        users: vec![Named {
            name: "admin".to_string(),
            inner: User {
                user: UserEntry {
                    client_certificate: pki.join("admin.crt"),
                    client_key: pki.join("admin.key"),
                },
            },
        }],
        contexts: vec![Named {
            name: context.clone(),
            inner: Context {
                context: ContextEntry {
                    cluster: CLUSTER_NAME.to_string(),
                    user: "admin".to_string(),
                },
            },
        }],
        current_context: context,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Write CNI, containerd and kubelet configuration.
pub fn write_service_configs(config: &BootstrapConfig) -> Result<Vec<PathBuf>> {
    let cni = serde_json::to_string_pretty(&cni_config(config))?;
    let files = [
        (config.cni_conf_dir.join(CNI_CONF_NAME), cni),
        (config.containerd_config.clone(), containerd_config(config)),
        (config.kubelet_config(), kubelet_config(config)),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (path, contents) in files {
        write_config(&path, &contents)?;
        written.push(path);
    }
    Ok(written)
}

/// Write the admin kubeconfig and the kubelet's copy of it.
pub fn write_kubeconfigs(config: &BootstrapConfig) -> Result<Vec<PathBuf>> {
    let doc = admin_kubeconfig(config)?;
    let paths = [config.admin_kubeconfig.clone(), config.kubelet_kubeconfig()];
    for path in &paths {
        write_config(path, &doc)?;
    }
    Ok(paths.to_vec())
}

fn write_config(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BootstrapError::io(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| BootstrapError::io(path, e))?;
    debug!(path = %path.display(), "Wrote config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cni_uses_pod_subnet() {
        let config = BootstrapConfig::rooted_at(Path::new("/tmp/x"));
        let cni = cni_config(&config);
        assert_eq!(cni["ipam"]["subnet"], "10.22.0.0/16");
        assert_eq!(cni["type"], "bridge");
    }

    #[test]
    fn service_configs_point_at_configured_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = BootstrapConfig::rooted_at(dir.path());
        let written = write_service_configs(&config).unwrap();
        assert_eq!(written.len(), 3);

        let containerd = fs::read_to_string(&config.containerd_config).unwrap();
        assert!(containerd.contains(&format!(
            "address = \"{}\"",
            config.containerd_socket.display()
        )));
        assert!(toml::from_str::<toml::Table>(&containerd).is_ok());

        let kubelet = fs::read_to_string(config.kubelet_config()).unwrap();
        assert!(kubelet.contains("clusterDNS:\n  - \"10.0.0.10\""));
    }

    #[test]
    fn kubeconfig_references_admin_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = BootstrapConfig::rooted_at(dir.path());
        let paths = write_kubeconfigs(&config).unwrap();
        assert_eq!(paths[1], config.kubelet_kubeconfig());

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config.admin_kubeconfig).unwrap()).unwrap();
        assert_eq!(doc["current-context"], "admin@kubestrap");
        assert_eq!(doc["clusters"][0]["cluster"]["server"], "https://127.0.0.1:6443");
        assert_eq!(
            doc["users"][0]["user"]["client-key"],
            config.pki_dir().join("admin.key").display().to_string()
        );
    }
}
