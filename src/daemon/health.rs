use std::path::PathBuf;
use tracing::{error, warn};

use super::log_tail::tail_lines;
use super::DaemonHandle;

/// Lines of service log included in diagnostics.
pub const DIAGNOSTIC_LOG_LINES: usize = 20;

/// Check if a process exists (signal 0).
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

/// Snapshot of a service that failed its readiness probe.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    pub service: String,
    pub pid: u32,
    pub running: bool,
    pub log_path: PathBuf,
    pub log_tail: Vec<String>,
}

impl Diagnostics {
    /// Emit the snapshot through tracing.
    pub fn log(&self) {
        if self.running {
            warn!(
                service = %self.service,
                pid = self.pid,
                "Process is running but never became ready"
            );
        } else {
            error!(service = %self.service, pid = self.pid, "Process is not running");
        }

        if self.log_tail.is_empty() {
            warn!(log = %self.log_path.display(), "Service log is empty or missing");
            return;
        }
        warn!(
            "Last {} lines of {}:",
            self.log_tail.len(),
            self.log_path.display()
        );
        for line in &self.log_tail {
            warn!("  {}", line);
        }
    }
}

/// Liveness plus recent log output for a launched daemon.
pub fn capture_diagnostics(handle: &DaemonHandle) -> Diagnostics {
    Diagnostics {
        service: handle.name.clone(),
        pid: handle.pid,
        running: is_process_running(handle.pid),
        log_path: handle.log_path.clone(),
        log_tail: tail_lines(&handle.log_path, DIAGNOSTIC_LOG_LINES),
    }
}
