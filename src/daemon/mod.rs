//! Daemon Supervisor - launches control-plane services and lets them run
//!
//! Each service runs as a detached child process whose stdout and stderr are
//! appended to a per-service log file. Launch returns as soon as the process
//! exists; a background reaper collects its exit status.
//!
//! ```text
//! ┌──────────────┐  launch   ┌─────────────────┐
//! │  installer   │ ────────► │  child process  │ ──► <log_dir>/<svc>.log
//! └──────────────┘           └─────────────────┘
//!        │                           ▲
//!        │ probe (readiness)         │ wait() (reaper task)
//!        ▼                           │
//!   service listener          tokio::spawn
//! ```
//!
//! There is no stop, restart or crash detection.

pub mod health;
pub mod log_tail;
pub mod supervisor;

pub use health::{capture_diagnostics, is_process_running, Diagnostics};
pub use log_tail::tail_lines;
pub use supervisor::{DaemonHandle, DaemonSpec, DaemonSupervisor};
