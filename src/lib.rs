pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;
pub mod installer;
pub mod kube_api;
pub mod pipeline;
pub mod pki;
pub mod provision;
pub mod readiness;
pub mod services;
pub mod templates;
pub mod verify;

pub use config::BootstrapConfig;
pub use error::{BootstrapError, Result};
pub use installer::Installer;
