use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{
    generate_bootstrap_token, CertRole, CertificateAuthority, IssuedCert, ServiceAccountKey,
    TrustBundle, Usage,
};
use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, Result};

const ROOT_SERIAL: u64 = 1;
const ROOT_COMMON_NAME: &str = "kubernetes-ca";
const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// In-cluster DNS aliases of the API endpoint, plus localhost.
const API_DNS_NAMES: [&str; 5] = [
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
    "localhost",
];

/// Issues the root authority and leaf certificates for one install run.
pub struct Issuer {
    host_ip: IpAddr,
    service_ip: Option<Ipv4Addr>,
    root_validity: Duration,
    leaf_validity: Duration,
    next_serial: AtomicU64,
}

impl Issuer {
    pub fn new(config: &BootstrapConfig) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Self {
            host_ip: config.host_ip,
            service_ip: first_service_ip(&config.service_cidr),
            root_validity: Duration::from_secs(config.pki.root_validity_days as u64 * SECS_PER_DAY),
            leaf_validity: Duration::from_secs(config.pki.leaf_validity_days as u64 * SECS_PER_DAY),
            // Keep serials positive and clear of the root's constant.
            next_serial: AtomicU64::new((seed & (u64::MAX >> 1)).max(ROOT_SERIAL + 1)),
        }
    }

    /// Generate a self-signed certificate authority.
    pub fn issue_root(&self) -> Result<CertificateAuthority> {
        let key = KeyPair::generate().map_err(|e| {
            BootstrapError::KeyGeneration(format!("failed to generate CA key pair: {e}"))
        })?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| BootstrapError::Signing(format!("failed to create CA params: {e}")))?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, ROOT_COMMON_NAME);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Kubernetes");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.serial_number = Some(SerialNumber::from(ROOT_SERIAL));
        let not_before = SystemTime::now();
        params.not_before = not_before.into();
        params.not_after = (not_before + self.root_validity).into();

        let cert = params
            .self_signed(&key)
            .map_err(|e| BootstrapError::Signing(format!("failed to self-sign CA: {e}")))?;

        tracing::debug!(common_name = ROOT_COMMON_NAME, "Issued root certificate");
        Ok(CertificateAuthority { cert, key })
    }

    /// Generate a leaf certificate signed by `root`, valid for `validity`
    /// from now. Server usage adds the fixed API endpoint SAN set.
    pub fn issue_leaf(
        &self,
        root: &CertificateAuthority,
        common_name: &str,
        organization: Option<&str>,
        usages: &[Usage],
        validity: Duration,
    ) -> Result<IssuedCert> {
        let key = KeyPair::generate().map_err(|e| {
            BootstrapError::KeyGeneration(format!("failed to generate key for {common_name}: {e}"))
        })?;

        let serves = usages.contains(&Usage::ServerAuth);
        let dns_names: Vec<String> = if serves {
            API_DNS_NAMES.iter().map(|s| s.to_string()).collect()
        } else {
            Vec::new()
        };

        let mut params = CertificateParams::new(dns_names).map_err(|e| {
            BootstrapError::Signing(format!("failed to create params for {common_name}: {e}"))
        })?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        if let Some(org) = organization {
            params.distinguished_name.push(DnType::OrganizationName, org);
        }
        if serves {
            for ip in self.server_ips() {
                params.subject_alt_names.push(SanType::IpAddress(ip));
            }
        }
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = usages
            .iter()
            .map(|usage| match usage {
                Usage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
                Usage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            })
            .collect();

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        params.serial_number = Some(SerialNumber::from(serial));
        let not_before = SystemTime::now();
        params.not_before = not_before.into();
        params.not_after = (not_before + validity).into();

        let cert = params
            .signed_by(&key, &root.cert, &root.key)
            .map_err(|e| BootstrapError::Signing(format!("failed to sign {common_name}: {e}")))?;

        tracing::debug!(common_name, serial, "Issued leaf certificate");
        Ok(IssuedCert {
            common_name: common_name.to_string(),
            serial,
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            der: cert.der().to_vec(),
        })
    }

    pub fn issue_service_account(&self) -> Result<ServiceAccountKey> {
        let key = KeyPair::generate().map_err(|e| {
            BootstrapError::KeyGeneration(format!("failed to generate service account key: {e}"))
        })?;
        Ok(ServiceAccountKey {
            private_pem: key.serialize_pem(),
            public_pem: key.public_key_pem(),
        })
    }

    /// Root, admin client, API server and service-account material, chain-checked.
    pub fn issue_bundle(&self) -> Result<TrustBundle> {
        tracing::info!("Generating CA certificate...");
        let root = self.issue_root()?;

        let mut leaves = BTreeMap::new();
        for role in CertRole::ALL {
            let leaf = match role {
                CertRole::Admin => {
                    tracing::info!("Generating admin certificate...");
                    self.issue_leaf(
                        &root,
                        "admin",
                        Some("system:masters"),
                        &[Usage::ClientAuth],
                        self.leaf_validity,
                    )?
                }
                CertRole::ApiServer => {
                    tracing::info!("Generating API server certificate...");
                    self.issue_leaf(
                        &root,
                        "kube-apiserver",
                        None,
                        &[Usage::ServerAuth, Usage::ClientAuth],
                        self.leaf_validity,
                    )?
                }
            };
            leaves.insert(role, leaf);
        }

        tracing::info!("Generating service account keys...");
        let service_account = self.issue_service_account()?;

        let bundle = TrustBundle {
            root,
            leaves,
            service_account,
            bootstrap_token: generate_bootstrap_token(),
        };
        bundle.verify_chain()?;
        Ok(bundle)
    }

    fn server_ips(&self) -> Vec<IpAddr> {
        let mut ips = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
        if let Some(service_ip) = self.service_ip {
            ips.push(IpAddr::V4(service_ip));
        }
        if !self.host_ip.is_loopback() && !ips.contains(&self.host_ip) {
            ips.push(self.host_ip);
        }
        ips
    }
}

/// First usable address of an IPv4 CIDR, i.e. the in-cluster API service IP.
pub fn first_service_ip(cidr: &str) -> Option<Ipv4Addr> {
    let (network, prefix) = cidr.split_once('/')?;
    let network: Ipv4Addr = network.trim().parse().ok()?;
    let prefix: u32 = prefix.trim().parse().ok()?;
    if prefix >= 31 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Some(Ipv4Addr::from((u32::from(network) & mask) + 1))
}
