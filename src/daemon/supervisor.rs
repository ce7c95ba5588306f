use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{BootstrapError, Result};

/// What to launch and where its output goes.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub log_path: PathBuf,
}

impl DaemonSpec {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            log_path: log_path.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command_line(&self) -> String {
        let mut line = self.command.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A launched process. Informational only; it cannot stop the process.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub log_path: PathBuf,
    pub pid: u32,
}

/// Starts detached service processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DaemonSupervisor;

impl DaemonSupervisor {
    pub fn new() -> Self {
        Self
    }

    /// Start `spec` with stdout and stderr appended to its log file.
    ///
    /// Returns once the OS has created the process. Must be called from
    /// within a tokio runtime, which hosts the reaper task.
    pub fn launch(&self, spec: &DaemonSpec) -> Result<DaemonHandle> {
        let launch_err = |reason: String| BootstrapError::Launch {
            command: spec.command.display().to_string(),
            reason,
            log_hint: Some(spec.log_path.clone()),
        };

        let log = open_log(&spec.log_path).map_err(|e| {
            launch_err(format!(
                "cannot open log {}: {}",
                spec.log_path.display(),
                e
            ))
        })?;
        let stderr = log
            .try_clone()
            .map_err(|e| launch_err(format!("cannot duplicate log handle: {e}")))?;

        append_marker(&spec.log_path, &format!("starting: {}", spec.command_line()));

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| launch_err(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err("process exited before a PID was assigned".into()))?;

        info!(service = %spec.name, pid, log = %spec.log_path.display(), "Started");

        let name = spec.name.clone();
        let log_path = spec.log_path.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!(service = %name, pid, %status, "Process exited");
                    append_marker(&log_path, &format!("{name} (pid {pid}) exited: {status}"));
                }
                Err(e) => warn!(service = %name, pid, error = %e, "Failed to reap process"),
            }
        });

        Ok(DaemonHandle {
            name: spec.name.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            log_path: spec.log_path.clone(),
            pid,
        })
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Best-effort bookkeeping line in a service log.
fn append_marker(path: &Path, message: &str) {
    let result = OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "[kubestrap] {message}"));
    if let Err(e) = result {
        debug!(path = %path.display(), error = %e, "Could not write log marker");
    }
}
