use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("failed to launch '{command}': {reason}")]
    Launch {
        command: String,
        reason: String,
        log_hint: Option<PathBuf>,
    },

    #[error("{probe} did not become ready after {attempts} attempts (last result: {last_result})")]
    ReadinessTimeout {
        probe: String,
        attempts: u32,
        last_result: String,
        /// Log file worth inspecting, when the probe guards a launched daemon
        log_hint: Option<PathBuf>,
    },

    #[error("invalid probe spec: {0}")]
    InvalidProbeSpec(String),

    #[error("step '{step}' failed: {source}")]
    StepFailure {
        step: String,
        #[source]
        source: Box<BootstrapError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("API request failed: {0}")]
    Api(String),

    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BootstrapError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap an error with the name of the step it surfaced in.
    pub fn in_step(self, step: &str) -> Self {
        Self::StepFailure {
            step: step.to_string(),
            source: Box::new(self),
        }
    }

    /// Log file an operator should look at, if any.
    pub fn log_hint(&self) -> Option<&PathBuf> {
        match self {
            Self::ReadinessTimeout { log_hint, .. } | Self::Launch { log_hint, .. } => {
                log_hint.as_ref()
            }
            Self::StepFailure { source, .. } => source.log_hint(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_keeps_cause_and_hint() {
        let err = BootstrapError::ReadinessTimeout {
            probe: "apiserver".into(),
            attempts: 3,
            last_result: "connection refused".into(),
            log_hint: Some(PathBuf::from("/var/log/kubernetes/apiserver.log")),
        }
        .in_step("Starting API server");

        let msg = err.to_string();
        assert!(msg.starts_with("step 'Starting API server' failed"));
        assert!(msg.contains("apiserver did not become ready after 3 attempts"));
        assert_eq!(
            err.log_hint(),
            Some(&PathBuf::from("/var/log/kubernetes/apiserver.log"))
        );
    }

    #[test]
    fn launch_error_points_at_service_log() {
        let err = BootstrapError::Launch {
            command: "/var/lib/kubernetes/bin/etcd".into(),
            reason: "No such file or directory (os error 2)".into(),
            log_hint: Some(PathBuf::from("/var/log/kubernetes/etcd.log")),
        }
        .in_step("Start etcd");

        assert_eq!(
            err.log_hint(),
            Some(&PathBuf::from("/var/log/kubernetes/etcd.log"))
        );
    }

    #[test]
    fn plain_errors_have_no_log_hint() {
        let err = BootstrapError::KeyGeneration("entropy".into());
        assert!(err.log_hint().is_none());
    }
}
