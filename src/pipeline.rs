//! Sequential step pipeline with per-step failure policy.
//!
//! Steps run strictly in declaration order. A failing step halts the run
//! only when it is critical and `continue_on_error` is unset; every other
//! failure is recorded and reported at the end.

use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io::IsTerminal;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{BootstrapError, Result};

pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;
type StepAction<'a> = Box<dyn FnOnce() -> StepFuture<'a> + 'a>;

/// One unit of work. Critical by default.
pub struct InstallStep<'a> {
    name: String,
    critical: bool,
    skip: bool,
    action: StepAction<'a>,
}

impl<'a> InstallStep<'a> {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + 'a,
        Fut: Future<Output = Result<()>> + 'a,
    {
        Self {
            name: name.into(),
            critical: true,
            skip: false,
            action: Box::new(move || Box::pin(action())),
        }
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Mark the step skipped. Skipped steps never run, critical or not.
    pub fn skip_if(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub succeeded: bool,
    pub skipped: bool,
    pub critical: bool,
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl StepOutcome {
    fn skipped(critical: bool) -> Self {
        Self {
            succeeded: true,
            skipped: true,
            critical,
            error: None,
            elapsed: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
pub enum RunState {
    Pending,
    Running(usize),
    Succeeded,
    /// Halted at `step`. `error` is a `StepFailure`.
    Failed {
        step: String,
        error: BootstrapError,
    },
    /// Finished, but these steps failed.
    PartiallyFailed(Vec<String>),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::PartiallyFailed(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running(_) => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::PartiallyFailed(_) => "partially failed",
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    /// Outcomes of steps that were reached, in order.
    pub steps: Vec<(String, StepOutcome)>,
    pub state: RunState,
}

impl RunReport {
    /// `Succeeded` or `PartiallyFailed`.
    pub fn completed(&self) -> bool {
        matches!(self.state, RunState::Succeeded | RunState::PartiallyFailed(_))
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, outcome)| outcome)
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, o)| !o.succeeded)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Log the end-of-run summary, including every non-halting failure.
    pub fn log_summary(&self) {
        match &self.state {
            RunState::Succeeded => info!(steps = self.steps.len(), "All steps succeeded"),
            RunState::PartiallyFailed(failed) => {
                warn!("Completed with {} failed step(s):", failed.len());
                for (name, outcome) in self.steps.iter().filter(|(_, o)| !o.succeeded) {
                    warn!(
                        "  - {}: {}",
                        name,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            RunState::Failed { step, error } => {
                error!(step = %step, "Halted: {}", error);
                if let Some(log) = error.log_hint() {
                    error!("Inspect {} for details", log.display());
                }
            }
            RunState::Pending | RunState::Running(_) => {}
        }
    }
}

/// Runs a list of `InstallStep`s.
pub struct Pipeline {
    label: String,
    continue_on_error: bool,
    progress: bool,
    state: RunState,
}

impl Pipeline {
    pub fn new(label: impl Into<String>, continue_on_error: bool) -> Self {
        Self {
            label: label.into(),
            continue_on_error,
            progress: false,
            state: RunState::Pending,
        }
    }

    /// Render a spinner per step when stderr is a terminal.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled && std::io::stderr().is_terminal();
        self
    }

    pub async fn run(mut self, steps: Vec<InstallStep<'_>>) -> RunReport {
        let total = steps.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut failures = Vec::new();

        info!(pipeline = %self.label, steps = total, "Starting");

        for (index, step) in steps.into_iter().enumerate() {
            self.state = RunState::Running(index);
            let InstallStep {
                name,
                critical,
                skip,
                action,
            } = step;

            if skip {
                info!(step = %name, "[{}/{}] {} (skipped)", index + 1, total, name);
                outcomes.push((name, StepOutcome::skipped(critical)));
                continue;
            }

            info!(step = %name, "[{}/{}] {}", index + 1, total, name);
            let spinner = self.progress.then(|| create_spinner(&name));
            let started = Instant::now();
            let result = action().await;
            let elapsed = started.elapsed();

            match result {
                Ok(()) => {
                    if let Some(pb) = spinner {
                        pb.finish_with_message(format!("{name} done"));
                    }
                    outcomes.push((
                        name,
                        StepOutcome {
                            succeeded: true,
                            skipped: false,
                            critical,
                            error: None,
                            elapsed,
                        },
                    ));
                }
                Err(e) => {
                    if let Some(pb) = spinner {
                        pb.finish_with_message(format!("{name} failed"));
                    }
                    let failure = e.in_step(&name);
                    let detail = failure.to_string();
                    outcomes.push((
                        name.clone(),
                        StepOutcome {
                            succeeded: false,
                            skipped: false,
                            critical,
                            error: Some(detail.clone()),
                            elapsed,
                        },
                    ));

                    if critical && !self.continue_on_error {
                        error!(step = %name, error = %detail, "Critical step failed");
                        self.state = RunState::Failed {
                            error: failure,
                            step: name,
                        };
                        return RunReport {
                            steps: outcomes,
                            state: self.state,
                        };
                    }

                    if critical {
                        warn!(step = %name, error = %detail, "Critical step failed, continuing on error");
                    } else {
                        warn!(step = %name, error = %detail, "Non-critical step failed, continuing");
                    }
                    failures.push(name);
                }
            }
        }

        self.state = if failures.is_empty() {
            RunState::Succeeded
        } else {
            RunState::PartiallyFailed(failures)
        };
        info!(pipeline = %self.label, state = self.state.label(), "Finished");

        RunReport {
            steps: outcomes,
            state: self.state,
        }
    }
}

fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn step<'a>(name: &'static str, ran: &'a RefCell<Vec<&'static str>>, ok: bool) -> InstallStep<'a> {
        InstallStep::new(name, move || async move {
            ran.borrow_mut().push(name);
            if ok {
                Ok(())
            } else {
                Err(BootstrapError::Config(format!("{name} exploded")))
            }
        })
    }

    fn abc<'a>(ran: &'a RefCell<Vec<&'static str>>) -> Vec<InstallStep<'a>> {
        vec![
            step("A", ran, true),
            step("B", ran, false),
            step("C", ran, true).non_critical(),
        ]
    }

    #[tokio::test]
    async fn critical_failure_halts_run() {
        let ran = RefCell::new(Vec::new());
        let report = Pipeline::new("test", false).run(abc(&ran)).await;

        assert_eq!(*ran.borrow(), vec!["A", "B"]);
        match &report.state {
            RunState::Failed { step, error } => {
                assert_eq!(step, "B");
                assert!(matches!(error, BootstrapError::StepFailure { step, .. } if step == "B"));
            }
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(report.outcome("C").is_none());
        assert!(!report.completed());
    }

    #[tokio::test]
    async fn continue_on_error_runs_everything() {
        let ran = RefCell::new(Vec::new());
        let report = Pipeline::new("test", true).run(abc(&ran)).await;

        assert_eq!(*ran.borrow(), vec!["A", "B", "C"]);
        match &report.state {
            RunState::PartiallyFailed(failed) => assert_eq!(failed, &vec!["B".to_string()]),
            other => panic!("unexpected state: {other:?}"),
        }
        assert!(report.outcome("C").unwrap().succeeded);
        assert_eq!(
            report.outcome("B").unwrap().error.as_deref(),
            Some("step 'B' failed: configuration error: B exploded")
        );
        assert!(report.completed());
    }

    #[tokio::test]
    async fn non_critical_failure_never_halts() {
        for continue_on_error in [false, true] {
            let ran = RefCell::new(Vec::new());
            let steps = vec![
                step("optional", &ran, false).non_critical(),
                step("next", &ran, true),
            ];
            let report = Pipeline::new("test", continue_on_error).run(steps).await;

            assert_eq!(*ran.borrow(), vec!["optional", "next"]);
            assert!(matches!(report.state, RunState::PartiallyFailed(ref f) if f == &["optional"]));
        }
    }

    #[tokio::test]
    async fn skipped_steps_never_execute() {
        let ran = RefCell::new(Vec::new());
        let steps = vec![
            step("download", &ran, false).skip_if(true),
            step("certs", &ran, true),
            step("verify", &ran, false).non_critical().skip_if(true),
        ];
        let report = Pipeline::new("test", false).run(steps).await;

        assert_eq!(*ran.borrow(), vec!["certs"]);
        assert!(matches!(report.state, RunState::Succeeded));
        assert!(report.outcome("download").unwrap().skipped);
        assert!(report.failed_steps().is_empty());
    }

    #[tokio::test]
    async fn empty_pipeline_succeeds() {
        let report = Pipeline::new("empty", false).run(Vec::new()).await;
        assert!(matches!(report.state, RunState::Succeeded));
        assert!(report.state.is_terminal());
    }

    #[tokio::test]
    async fn halt_preserves_log_hint() {
        let steps = vec![InstallStep::new("etcd", || async {
            Err(BootstrapError::ReadinessTimeout {
                probe: "etcd".into(),
                attempts: 30,
                last_result: "connection refused".into(),
                log_hint: Some("/var/log/kubernetes/etcd.log".into()),
            })
        })];
        let report = Pipeline::new("test", false).run(steps).await;

        let RunState::Failed { error, .. } = &report.state else {
            panic!("expected failure");
        };
        assert_eq!(
            error.log_hint().map(|p| p.display().to_string()).as_deref(),
            Some("/var/log/kubernetes/etcd.log")
        );
        report.log_summary();
    }
}
