//! Binary provisioning: fetch release artifacts and place the executables
//! where the service catalog expects them.

use flate2::read::GzDecoder;
use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};

/// How a downloaded payload lands on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unpack {
    /// Single executable written to `dest`.
    Binary { dest: PathBuf },
    /// Gzipped tarball extracted under `dest_dir`, dropping leading path
    /// components.
    TarGz { dest_dir: PathBuf, strip_components: usize },
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: &'static str,
    pub url: String,
    pub unpack: Unpack,
}

fn release_arch() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "amd64"
    }
}

/// Everything the services need, in download order.
pub fn artifacts(config: &BootstrapConfig) -> Vec<Artifact> {
    let arch = release_arch();
    let v = &config.versions;
    let k8s = &config.k8s_version;
    let bin = config.bin_dir();

    let k8s_binary = |name: &'static str| Artifact {
        name,
        url: format!("https://dl.k8s.io/{k8s}/bin/linux/{arch}/{name}"),
        unpack: Unpack::Binary {
            dest: bin.join(name),
        },
    };

    vec![
        // etcd, kube-apiserver, kubectl under <base>/bin
        Artifact {
            name: "kubebuilder-tools",
            url: format!(
                "https://storage.googleapis.com/kubebuilder-tools/kubebuilder-tools-{}-linux-{arch}.tar.gz",
                v.kubebuilder_tools
            ),
            unpack: Unpack::TarGz {
                dest_dir: config.base_dir.clone(),
                strip_components: 1,
            },
        },
        k8s_binary("kubelet"),
        k8s_binary("kube-controller-manager"),
        k8s_binary("kube-scheduler"),
        Artifact {
            name: "containerd",
            url: format!(
                "https://github.com/containerd/containerd/releases/download/v{0}/containerd-{0}-linux-{arch}.tar.gz",
                v.containerd
            ),
            unpack: Unpack::TarGz {
                dest_dir: bin.clone(),
                strip_components: 1,
            },
        },
        Artifact {
            name: "runc",
            url: format!(
                "https://github.com/opencontainers/runc/releases/download/{}/runc.{arch}",
                v.runc
            ),
            unpack: Unpack::Binary {
                dest: bin.join("runc"),
            },
        },
        Artifact {
            name: "cni-plugins",
            url: format!(
                "https://github.com/containernetworking/plugins/releases/download/{0}/cni-plugins-linux-{arch}-{0}.tgz",
                v.cni_plugins
            ),
            unpack: Unpack::TarGz {
                dest_dir: config.cni_bin_dir.clone(),
                strip_components: 0,
            },
        },
        Artifact {
            name: "crictl",
            url: format!(
                "https://github.com/kubernetes-sigs/cri-tools/releases/download/{0}/crictl-{0}-linux-{arch}.tar.gz",
                v.crictl
            ),
            unpack: Unpack::TarGz {
                dest_dir: bin,
                strip_components: 0,
            },
        },
    ]
}

pub struct Provisioner {
    http: reqwest::Client,
}

impl Provisioner {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("kubestrap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BootstrapError::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    pub async fn provision_all(&self, config: &BootstrapConfig) -> Result<()> {
        let artifacts = artifacts(config);
        let total = artifacts.len();
        for (i, artifact) in artifacts.iter().enumerate() {
            info!("  Downloading {} ({}/{})", artifact.name, i + 1, total);
            self.fetch(artifact).await?;
        }
        Ok(())
    }

    pub async fn fetch(&self, artifact: &Artifact) -> Result<()> {
        let download_err = |reason: String| BootstrapError::Download {
            url: artifact.url.clone(),
            reason,
        };

        let response = self
            .http
            .get(&artifact.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_err(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| download_err(format!("failed to read body: {e}")))?;
        debug!(url = %artifact.url, bytes = bytes.len(), "Downloaded");

        match &artifact.unpack {
            Unpack::Binary { dest } => write_executable(dest, &bytes),
            Unpack::TarGz {
                dest_dir,
                strip_components,
            } => extract_tar_gz(&bytes, dest_dir, *strip_components).map(|files| {
                debug!(archive = artifact.name, files = files.len(), "Extracted");
            }),
        }
    }
}

fn write_executable(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| BootstrapError::io(parent, e))?;
    }
    fs::write(dest, bytes).map_err(|e| BootstrapError::io(dest, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755))
            .map_err(|e| BootstrapError::io(dest, e))?;
    }
    Ok(())
}

/// Extract regular files from a `.tar.gz` payload into `dest_dir`.
/// Entries that would escape `dest_dir` are rejected.
pub fn extract_tar_gz(bytes: &[u8], dest_dir: &Path, strip_components: usize) -> Result<Vec<PathBuf>> {
    let archive_err = |e: std::io::Error| BootstrapError::io(dest_dir, e);
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let mut written = Vec::new();

    for entry in archive.entries().map_err(archive_err)? {
        let mut entry = entry.map_err(archive_err)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path().map_err(archive_err)?.into_owned();
        let mut relative = PathBuf::new();
        for component in path.components().filter(|c| !matches!(c, Component::CurDir)).skip(strip_components) {
            match component {
                Component::Normal(part) => relative.push(part),
                _ => {
                    return Err(BootstrapError::Config(format!(
                        "archive entry escapes destination: {}",
                        path.display()
                    )))
                }
            }
        }
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = dest_dir.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| BootstrapError::io(parent, e))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| BootstrapError::io(&target, e))?;
        written.push(target);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn strips_leading_components() {
        let dir = tempfile::tempdir().unwrap();
        let payload = tarball(&[
            ("kubebuilder/bin/etcd", b"etcd"),
            ("kubebuilder/bin/kube-apiserver", b"apiserver"),
        ]);

        let written = extract_tar_gz(&payload, dir.path(), 1).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read(dir.path().join("bin/etcd")).unwrap(), b"etcd");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("bin/kube-apiserver"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn dot_prefixed_entries_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let payload = tarball(&[("./bridge", b"cni"), ("./host-local", b"ipam")]);
        extract_tar_gz(&payload, dir.path(), 0).unwrap();
        assert!(dir.path().join("bridge").exists());
        assert!(dir.path().join("host-local").exists());
    }

    #[test]
    fn corrupt_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(extract_tar_gz(b"definitely not gzip", dir.path(), 0).is_err());
    }

    #[test]
    fn artifact_urls_follow_versions() {
        let config = BootstrapConfig::rooted_at(Path::new("/tmp/x"));
        let list = artifacts(&config);
        let kubelet = list.iter().find(|a| a.name == "kubelet").unwrap();
        assert!(kubelet.url.starts_with("https://dl.k8s.io/v1.30.0/bin/linux/"));
        assert_eq!(
            kubelet.unpack,
            Unpack::Binary {
                dest: config.bin("kubelet")
            }
        );

        let containerd = list.iter().find(|a| a.name == "containerd").unwrap();
        assert!(containerd.url.contains("/v2.0.5/containerd-2.0.5-linux-"));
    }

    #[tokio::test]
    async fn http_error_is_download_error() {
        use axum::{http::StatusCode, routing::get, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/missing", get(|| async { StatusCode::NOT_FOUND }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact {
            name: "runc",
            url: format!("http://{addr}/missing"),
            unpack: Unpack::Binary {
                dest: dir.path().join("runc"),
            },
        };
        let err = Provisioner::new().unwrap().fetch(&artifact).await.unwrap_err();
        assert!(matches!(err, BootstrapError::Download { .. }));
        assert!(!dir.path().join("runc").exists());
    }
}
