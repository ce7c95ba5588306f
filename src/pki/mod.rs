//! Minimal PKI for a single-node control plane.
//!
//! One self-signed root signs every leaf. The bundle is generated once per
//! install, checked for chain consistency, then persisted to the canonical
//! PKI directory plus any fan-out copies other services expect.

pub mod issuer;
pub mod persist;

pub use issuer::Issuer;
pub use persist::{persist, Destinations, PersistReport};

use rand::distributions::Alphanumeric;
use rand::Rng;
use rcgen::{Certificate, KeyPair};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use x509_parser::prelude::*;

use crate::error::{BootstrapError, Result};

/// Extended key usage requested for a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    ClientAuth,
    ServerAuth,
}

/// Leaf certificates held by a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CertRole {
    Admin,
    ApiServer,
}

impl CertRole {
    pub const ALL: [CertRole; 2] = [CertRole::Admin, CertRole::ApiServer];

    /// File stem under the PKI directory (`<stem>.crt` / `<stem>.key`).
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::ApiServer => "apiserver",
        }
    }
}

/// Root authority. Holds the live key so further leaves can be signed.
pub struct CertificateAuthority {
    pub(crate) cert: Certificate,
    pub(crate) key: KeyPair,
}

impl CertificateAuthority {
    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn der(&self) -> &[u8] {
        self.cert.der()
    }
}

/// A signed leaf certificate with its private key.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub common_name: String,
    pub serial: u64,
    pub cert_pem: String,
    pub key_pem: String,
    pub(crate) der: Vec<u8>,
}

impl IssuedCert {
    pub fn der(&self) -> &[u8] {
        &self.der
    }
}

/// Service-account signing pair. Plain key material, not a certificate.
#[derive(Debug, Clone)]
pub struct ServiceAccountKey {
    pub private_pem: String,
    pub public_pem: String,
}

/// Everything the PKI step produces. Immutable once issued.
pub struct TrustBundle {
    pub root: CertificateAuthority,
    pub leaves: BTreeMap<CertRole, IssuedCert>,
    pub service_account: ServiceAccountKey,
    pub bootstrap_token: String,
}

impl TrustBundle {
    pub fn leaf(&self, role: CertRole) -> Option<&IssuedCert> {
        self.leaves.get(&role)
    }

    /// Check that every leaf was signed by this bundle's root.
    pub fn verify_chain(&self) -> Result<()> {
        for (role, leaf) in &self.leaves {
            verify_leaf(leaf.der(), self.root.der()).map_err(|e| {
                BootstrapError::Signing(format!("{} certificate: {}", role.file_stem(), e))
            })?;
        }
        Ok(())
    }

    /// Contents of the static token file accepted by the API server.
    pub fn token_file_contents(&self) -> String {
        format!(
            "{},system:bootstrap,10001,\"system:bootstrappers\"\n",
            self.bootstrap_token
        )
    }
}

/// Verify `leaf_der` was issued and signed by the certificate in `root_der`.
pub fn verify_leaf(leaf_der: &[u8], root_der: &[u8]) -> Result<()> {
    let (_, leaf) = X509Certificate::from_der(leaf_der)
        .map_err(|e| BootstrapError::Signing(format!("unparseable leaf: {e}")))?;
    let (_, root) = X509Certificate::from_der(root_der)
        .map_err(|e| BootstrapError::Signing(format!("unparseable root: {e}")))?;

    if leaf.issuer().to_string() != root.subject().to_string() {
        return Err(BootstrapError::Signing(format!(
            "issuer '{}' does not match root subject '{}'",
            leaf.issuer(),
            root.subject()
        )));
    }

    leaf.verify_signature(Some(root.public_key()))
        .map_err(|e| BootstrapError::Signing(format!("signature check failed: {e}")))
}

/// Random token in the `[a-z0-9]{6}.[a-z0-9]{16}` bootstrap-token shape.
pub fn generate_bootstrap_token() -> String {
    let mut rng = rand::thread_rng();
    let mut part = |len: usize| -> String {
        (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect()
    };
    let id = part(6);
    let secret = part(16);
    format!("{id}.{secret}")
}

/// First field of the first non-blank, non-comment line of a token file.
/// Returns `None` when the file is missing or holds no token.
pub fn read_bootstrap_token(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .and_then(|line| line.split(',').next())
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_has_bootstrap_shape() {
        let token = generate_bootstrap_token();
        let (id, secret) = token.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(token
            .chars()
            .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(token, generate_bootstrap_token());
    }

    #[test]
    fn read_token_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.csv");
        fs::write(
            &path,
            "# static tokens\n\n  abc123.0123456789abcdef ,system:bootstrap,10001,\"system:bootstrappers\"\n",
        )
        .unwrap();
        assert_eq!(
            read_bootstrap_token(&path).as_deref(),
            Some("abc123.0123456789abcdef")
        );
    }

    #[test]
    fn read_token_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_bootstrap_token(&dir.path().join("nope.csv")).is_none());
    }
}
