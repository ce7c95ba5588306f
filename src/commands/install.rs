use anyhow::Context;
use std::net::IpAddr;
use std::process::ExitCode;
use tracing::info;

use kubestrap::config::{BootstrapConfig, RunFlags};
use kubestrap::installer::Installer;
use kubestrap::pipeline::RunState;

pub(crate) struct InstallOptions {
    pub k8s_version: Option<String>,
    pub host_ip: Option<IpAddr>,
    pub node_name: Option<String>,
    pub flags: RunFlags,
}

pub(crate) async fn cmd_install(
    mut config: BootstrapConfig,
    options: InstallOptions,
) -> anyhow::Result<ExitCode> {
    if let Some(version) = options.k8s_version {
        config.k8s_version = version;
    }
    if let Some(ip) = options.host_ip {
        config.host_ip = ip;
    }
    if let Some(name) = options.node_name {
        config.node_name = name;
    }
    let config = config.with_flags(options.flags);

    info!(
        version = %config.k8s_version,
        host_ip = %config.host_ip,
        node = %config.node_name,
        "Installing Kubernetes control plane"
    );

    let installer = Installer::new(&config).context("Failed to initialise installer")?;
    let report = installer.run().await;
    report.log_summary();

    match report.state {
        RunState::Succeeded => {
            info!(
                "Control plane is up. Use: kubectl --kubeconfig {} get nodes",
                config.admin_kubeconfig.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        RunState::PartiallyFailed(_) => Ok(ExitCode::SUCCESS),
        _ => Ok(ExitCode::FAILURE),
    }
}
