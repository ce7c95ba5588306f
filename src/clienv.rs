//! Environment lookups. Nothing outside `config` should call into this module:
//! the resulting values are folded into `BootstrapConfig` once at startup.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    BaseDir,
    KubeletDir,
    LogDir,
    HostIp,
    NodeName,
    Path,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BaseDir => "K8S_BASE_DIR",
            Self::KubeletDir => "K8S_KUBELET_DIR",
            Self::LogDir => "K8S_LOG_DIR",
            Self::HostIp => "K8S_HOST_IP",
            Self::NodeName => "K8S_NODE_NAME",
            Self::Path => "PATH",
        }
    }
}

fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Overrides collected from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub base_dir: Option<PathBuf>,
    pub kubelet_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub host_ip: Option<String>,
    pub node_name: Option<String>,
    /// Inherited `PATH`, extended for launched services.
    pub path: Option<String>,
}

pub fn overrides() -> EnvOverrides {
    let overrides = EnvOverrides {
        base_dir: env_opt(EnvVar::BaseDir).map(PathBuf::from),
        kubelet_dir: env_opt(EnvVar::KubeletDir).map(PathBuf::from),
        log_dir: env_opt(EnvVar::LogDir).map(PathBuf::from),
        host_ip: env_opt(EnvVar::HostIp),
        node_name: env_opt(EnvVar::NodeName),
        path: env_opt(EnvVar::Path),
    };
    tracing::trace!(?overrides, "Environment overrides");
    overrides
}

/// Home directory, used only for the default admin kubeconfig location.
pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"))
}

/// Kernel hostname, or `localhost` when it cannot be read.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is valid for buf.len() bytes; gethostname NUL-terminates on success.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_lowercase();
                }
            }
        }
    }
    "localhost".to_string()
}
