use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::TrustBundle;
use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};

const CERT_MODE: u32 = 0o644;
const SECRET_MODE: u32 = 0o600;

/// One file produced from a bundle.
struct Artifact {
    file_name: String,
    contents: String,
    secret: bool,
}

fn artifacts(bundle: &TrustBundle) -> Vec<Artifact> {
    let mut out = vec![
        Artifact {
            file_name: "ca.crt".into(),
            contents: bundle.root.cert_pem(),
            secret: false,
        },
        Artifact {
            file_name: "ca.key".into(),
            contents: bundle.root.key_pem(),
            secret: true,
        },
    ];
    for (role, leaf) in &bundle.leaves {
        out.push(Artifact {
            file_name: format!("{}.crt", role.file_stem()),
            contents: leaf.cert_pem.clone(),
            secret: false,
        });
        out.push(Artifact {
            file_name: format!("{}.key", role.file_stem()),
            contents: leaf.key_pem.clone(),
            secret: true,
        });
    }
    out.push(Artifact {
        file_name: "sa.key".into(),
        contents: bundle.service_account.private_pem.clone(),
        secret: true,
    });
    out.push(Artifact {
        file_name: "sa.pub".into(),
        contents: bundle.service_account.public_pem.clone(),
        secret: false,
    });
    out.push(Artifact {
        file_name: "token.csv".into(),
        contents: bundle.token_file_contents(),
        secret: true,
    });
    out
}

/// Where each artifact goes. The PKI directory copy is canonical; extra
/// destinations are convenience copies for services that look elsewhere.
#[derive(Debug, Clone)]
pub struct Destinations {
    pki_dir: PathBuf,
    extra: BTreeMap<String, Vec<PathBuf>>,
}

impl Destinations {
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn also(mut self, file_name: &str, path: impl Into<PathBuf>) -> Self {
        self.extra
            .entry(file_name.to_string())
            .or_default()
            .push(path.into());
        self
    }

    /// Canonical layout: everything under the PKI dir, the root certificate
    /// also where the kubelet expects it.
    pub fn for_config(config: &BootstrapConfig) -> Self {
        Self::new(config.pki_dir())
            .also("ca.crt", config.kubelet_dir.join("pki").join("ca.crt"))
            .also("ca.crt", config.kubelet_dir.join("ca.crt"))
    }

    pub fn pki_dir(&self) -> &Path {
        &self.pki_dir
    }
}

#[derive(Debug, Default)]
pub struct PersistReport {
    pub written: Vec<PathBuf>,
    /// Fan-out copies that could not be written, with the reason.
    pub failed_copies: Vec<(PathBuf, String)>,
}

/// Write every artifact to the PKI directory and to its extra destinations.
/// A failed canonical write is an error; a failed copy is logged and recorded.
pub fn persist(bundle: &TrustBundle, destinations: &Destinations) -> Result<PersistReport> {
    let mut report = PersistReport::default();

    for artifact in artifacts(bundle) {
        let canonical = destinations.pki_dir.join(&artifact.file_name);
        write_file(&canonical, &artifact.contents, artifact.secret)
            .map_err(|e| BootstrapError::io(&canonical, e))?;
        report.written.push(canonical);

        let Some(copies) = destinations.extra.get(&artifact.file_name) else {
            continue;
        };
        for copy in copies {
            let result = match copy.parent() {
                Some(parent) => fs::create_dir_all(parent),
                None => Ok(()),
            }
            .and_then(|_| write_file(copy, &artifact.contents, artifact.secret));

            match result {
                Ok(()) => report.written.push(copy.clone()),
                Err(e) => {
                    tracing::warn!(
                        path = %copy.display(),
                        error = %e,
                        "Failed to copy {}",
                        artifact.file_name
                    );
                    report.failed_copies.push((copy.clone(), e.to_string()));
                }
            }
        }
    }

    tracing::debug!(
        written = report.written.len(),
        failed = report.failed_copies.len(),
        "Trust material persisted"
    );
    Ok(report)
}

fn write_file(path: &Path, contents: &str, secret: bool) -> std::io::Result<()> {
    let mode = if secret { SECRET_MODE } else { CERT_MODE };

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(path)?;
    file.write_all(contents.as_bytes())?;

    // `mode` only applies on creation; tighten files left by an earlier run.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
