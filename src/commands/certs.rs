use anyhow::Context;
use std::net::IpAddr;
use std::path::Path;

use kubestrap::config::BootstrapConfig;
use kubestrap::pki::{self, Destinations, Issuer};

pub(crate) fn cmd_certs(
    mut config: BootstrapConfig,
    out: &Path,
    host_ip: Option<IpAddr>,
) -> anyhow::Result<()> {
    if let Some(ip) = host_ip {
        config.host_ip = ip;
    }

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let bundle = Issuer::new(&config)
        .issue_bundle()
        .context("Failed to issue trust bundle")?;
    let report = pki::persist(&bundle, &Destinations::new(out))
        .with_context(|| format!("Failed to write trust bundle to {}", out.display()))?;

    for path in &report.written {
        println!("{}", path.display());
    }
    Ok(())
}
