//! Post-install verification, run as its own small pipeline so optional
//! checks can fail without masking the critical ones.

use std::time::Duration;

use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};
use crate::pipeline::{InstallStep, Pipeline, RunReport, RunState};
use crate::readiness::{ProbeSpec, ProbeTarget, ReadinessProber, Transport};
use crate::services::API_SERVER_PORT;

#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub target: ProbeTarget,
    pub critical: bool,
    pub attempts: u32,
    pub interval: Duration,
}

impl Check {
    fn new(name: &str, target: ProbeTarget, critical: bool, attempts: u32) -> Self {
        Self {
            name: name.to_string(),
            target,
            critical,
            attempts,
            interval: Duration::from_secs(2),
        }
    }

    fn probe_spec(&self, credential: Option<String>) -> Result<ProbeSpec> {
        Ok(
            ProbeSpec::new(self.name.clone(), vec![self.target.clone()], 1, self.attempts)?
                .with_interval(self.interval)
                .with_credential(credential),
        )
    }
}

pub fn default_checks(config: &BootstrapConfig) -> Vec<Check> {
    let api = config.api_server_url();
    let get = |path: &str| ProbeTarget::Http(format!("{api}{path}"));
    vec![
        Check::new(
            "API server port",
            ProbeTarget::Tcp(format!("127.0.0.1:{API_SERVER_PORT}")),
            true,
            5,
        ),
        Check::new("API server health", get("/healthz"), true, 10),
        Check::new("API server readiness", get("/readyz?verbose"), false, 5),
        Check::new("Node list", get("/api/v1/nodes"), false, 5),
        Check::new("Default pods", get("/api/v1/namespaces/default/pods"), false, 3),
    ]
}

/// Run every check in order. Critical check failures halt the rest.
pub async fn run_checks<T: Transport>(
    prober: &ReadinessProber<T>,
    checks: Vec<Check>,
    credential: Option<String>,
) -> RunReport {
    let steps = checks
        .into_iter()
        .map(|check| {
            let credential = credential.clone();
            let critical = check.critical;
            let step = InstallStep::new(check.name.clone(), move || async move {
                let spec = check.probe_spec(credential)?;
                prober.await_ready(&spec).await.map(|_| ())
            });
            if critical {
                step
            } else {
                step.non_critical()
            }
        })
        .collect();

    Pipeline::new("verify", false).run(steps).await
}

/// Turn a verification report into the outer step's result.
pub fn into_result(report: RunReport) -> Result<()> {
    report.log_summary();
    match report.state {
        RunState::Failed { error, .. } => Err(error),
        RunState::Succeeded | RunState::PartiallyFailed(_) => Ok(()),
        RunState::Pending | RunState::Running(_) => Err(BootstrapError::Config(
            "verification did not finish".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::ProbeOutcome;
    use async_trait::async_trait;

    /// Everything answers except the listed targets.
    struct Failing(Vec<ProbeTarget>);

    #[async_trait]
    impl Transport for Failing {
        async fn attempt(&self, target: &ProbeTarget, _: Option<&str>) -> ProbeOutcome {
            if self.0.contains(target) {
                ProbeOutcome::NotReady("down".into())
            } else {
                ProbeOutcome::Ready
            }
        }
    }

    fn checks() -> Vec<Check> {
        let config = BootstrapConfig::rooted_at(std::path::Path::new("/tmp/x"));
        default_checks(&config)
    }

    #[tokio::test(start_paused = true)]
    async fn all_checks_pass() {
        let prober = ReadinessProber::new(Failing(Vec::new()));
        let report = run_checks(&prober, checks(), None).await;
        assert!(matches!(report.state, RunState::Succeeded));
        assert_eq!(report.steps.len(), 5);
        assert!(into_result(report).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn optional_check_failure_is_tolerated() {
        let nodes = ProbeTarget::Http("https://127.0.0.1:6443/api/v1/nodes".into());
        let prober = ReadinessProber::new(Failing(vec![nodes]));
        let report = run_checks(&prober, checks(), None).await;

        assert!(matches!(&report.state, RunState::PartiallyFailed(f) if f == &["Node list"]));
        assert!(into_result(report).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn critical_check_failure_halts() {
        let healthz = ProbeTarget::Http("https://127.0.0.1:6443/healthz".into());
        let prober = ReadinessProber::new(Failing(vec![healthz]));
        let report = run_checks(&prober, checks(), None).await;

        assert_eq!(report.steps.len(), 2);
        let err = into_result(report).unwrap_err();
        assert!(matches!(err, BootstrapError::StepFailure { ref step, .. } if step == "API server health"));
    }
}
