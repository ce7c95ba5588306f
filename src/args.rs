use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kubestrap")]
#[command(version)]
#[command(about = "Bootstrap a single-node Kubernetes control plane", long_about = None)]
pub(crate) struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Install and start the control plane on this host
    Install {
        /// Kubernetes release to install (e.g. v1.30.0)
        #[arg(long)]
        k8s_version: Option<String>,

        /// Address the services advertise (detected when omitted)
        #[arg(long)]
        host_ip: Option<IpAddr>,

        /// Node name registered by the kubelet (hostname when omitted)
        #[arg(long)]
        node_name: Option<String>,

        /// Use binaries already present under the base directory
        #[arg(long)]
        skip_download: bool,

        /// Skip post-install verification
        #[arg(long)]
        skip_verify: bool,

        /// Launch services without waiting for them to become ready
        #[arg(long)]
        skip_readiness_wait: bool,

        /// Keep going after a critical step fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Issue a trust bundle and write it to a directory
    Certs {
        /// Output directory
        #[arg(long)]
        out: PathBuf,

        /// Extra server address for the API server certificate
        #[arg(long)]
        host_ip: Option<IpAddr>,
    },

    /// Wait until one of the targets is ready
    Probe {
        /// Targets: tcp://host:port, unix:///path or http(s)://url
        #[arg(required = true)]
        targets: Vec<String>,

        /// Consecutive successful rounds required
        #[arg(long, default_value = "1")]
        threshold: u32,

        /// Maximum number of rounds
        #[arg(long, default_value = "30")]
        attempts: u32,

        /// Delay between rounds in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Per-request timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Bearer token used when a target answers 401/403
        #[arg(long, conflicts_with = "token_file")]
        token: Option<String>,

        /// Static token file to read the bearer token from
        #[arg(long)]
        token_file: Option<PathBuf>,

        /// CA certificate for HTTPS targets (certificates are not checked when omitted)
        #[arg(long)]
        ca_file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn install_flags_parse() {
        let cli = Cli::try_parse_from([
            "kubestrap",
            "install",
            "--skip-download",
            "--continue-on-error",
            "--host-ip",
            "10.0.0.5",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Install {
                skip_download,
                continue_on_error,
                skip_verify,
                host_ip,
                ..
            } => {
                assert!(skip_download);
                assert!(continue_on_error);
                assert!(!skip_verify);
                assert_eq!(host_ip, Some("10.0.0.5".parse().unwrap()));
            }
            _ => panic!("expected install"),
        }
    }

    #[test]
    fn probe_requires_a_target() {
        assert!(Cli::try_parse_from(["kubestrap", "probe"]).is_err());
        assert!(Cli::try_parse_from(["kubestrap", "probe", "tcp://127.0.0.1:2379"]).is_ok());
    }
}
