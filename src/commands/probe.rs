use anyhow::Context;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;

use kubestrap::pki::read_bootstrap_token;
use kubestrap::readiness::{NetworkTransport, ProbeSpec, ProbeTarget, ReadinessProber};

pub(crate) struct ProbeOptions {
    pub targets: Vec<String>,
    pub threshold: u32,
    pub attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

pub(crate) async fn cmd_probe(options: ProbeOptions) -> anyhow::Result<ExitCode> {
    let targets = options
        .targets
        .iter()
        .map(|t| t.parse::<ProbeTarget>())
        .collect::<Result<Vec<_>, _>>()?;

    let token = match (&options.token, &options.token_file) {
        (Some(token), _) => Some(token.clone()),
        (None, Some(path)) => Some(
            read_bootstrap_token(path)
                .with_context(|| format!("No token found in {}", path.display()))?,
        ),
        (None, None) => None,
    };

    let transport = match &options.ca_file {
        Some(path) => {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            NetworkTransport::trusting(&pem)?
        }
        None => NetworkTransport::new()?,
    };

    let spec = ProbeSpec::new("probe", targets, options.threshold, options.attempts)?
        .with_interval(options.interval)
        .with_timeout(options.timeout)
        .with_credential(token);

    match ReadinessProber::new(transport).await_ready(&spec).await {
        Ok(report) => {
            println!(
                "ready: {} ({} attempts, {:.1}s)",
                report.ready_target,
                report.attempts,
                report.elapsed.as_secs_f64()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
