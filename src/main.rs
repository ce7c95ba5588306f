mod args;
mod commands;

use anyhow::Context;
use args::{Cli, Commands};
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;

use commands::install::InstallOptions;
use commands::probe::ProbeOptions;
use kubestrap::config::{BootstrapConfig, RunFlags};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let load_config = || {
        BootstrapConfig::load(cli.config.as_deref()).context("Failed to load configuration")
    };

    match cli.command {
        Commands::Install {
            k8s_version,
            host_ip,
            node_name,
            skip_download,
            skip_verify,
            skip_readiness_wait,
            continue_on_error,
        } => {
            let options = InstallOptions {
                k8s_version,
                host_ip,
                node_name,
                flags: RunFlags {
                    skip_download,
                    skip_verify,
                    skip_readiness_wait,
                    continue_on_error,
                    verbose: cli.verbose,
                },
            };
            commands::install::cmd_install(load_config()?, options).await
        }
        Commands::Certs { out, host_ip } => {
            commands::certs::cmd_certs(load_config()?, &out, host_ip)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Probe {
            targets,
            threshold,
            attempts,
            interval_ms,
            timeout_ms,
            token,
            token_file,
            ca_file,
        } => {
            commands::probe::cmd_probe(ProbeOptions {
                targets,
                threshold,
                attempts,
                interval: Duration::from_millis(interval_ms),
                timeout: Duration::from_millis(timeout_ms),
                token,
                token_file,
                ca_file,
            })
            .await
        }
    }
}
