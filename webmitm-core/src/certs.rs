//! Dynamic leaf certificate minting for intercepted TLS.
//!
//! A root CA is generated once per process; leaf certificates are minted
//! per wildcarded hostname pattern and the assembled
//! [`rustls::ServerConfig`]s cached for reuse. The store is read
//! concurrently by every client task.

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub enum CertError {
    Generate(rcgen::Error),
    Tls(rustls::Error),
    Pem(io::Error),
    UnsupportedProtocol(String),
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertError::Generate(e) => write!(f, "certificate generation failed: {}", e),
            CertError::Tls(e) => write!(f, "TLS configuration failed: {}", e),
            CertError::Pem(e) => write!(f, "PEM material unreadable: {}", e),
            CertError::UnsupportedProtocol(p) => {
                write!(f, "unsupported TLS protocol version: {}", p)
            }
        }
    }
}

impl std::error::Error for CertError {}

impl From<rcgen::Error> for CertError {
    fn from(err: rcgen::Error) -> Self {
        CertError::Generate(err)
    }
}

impl From<rustls::Error> for CertError {
    fn from(err: rustls::Error) -> Self {
        CertError::Tls(err)
    }
}

/// Process-wide certificate authority and leaf cache.
pub struct CertificateStore {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    versions: Vec<&'static rustls::SupportedProtocolVersion>,
    cache: DashMap<String, Arc<ServerConfig>>,
}

impl CertificateStore {
    /// Generate a fresh root CA offering the named TLS versions
    /// ("1.2" / "1.3") on minted server configs.
    pub fn new(supported_protocols: &[String]) -> Result<Self, CertError> {
        let versions = protocol_versions(supported_protocols)?;

        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::new())?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "webmitm interception authority");
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_cert = params.clone().self_signed(&ca_key)?;
        let ca_der = ca_cert.der().clone();
        let issuer = Issuer::new(params, ca_key);

        Ok(Self {
            issuer,
            ca_der,
            versions,
            cache: DashMap::new(),
        })
    }

    /// The root certificate in DER form, for distribution to clients
    /// that should trust intercepted connections.
    pub fn ca_certificate(&self) -> CertificateDer<'static> {
        self.ca_der.clone()
    }

    /// Mint (or fetch from cache) a server configuration whose leaf
    /// certificate covers `pattern`.
    pub fn server_config(&self, pattern: &str) -> Result<Arc<ServerConfig>, CertError> {
        if let Some(cached) = self.cache.get(pattern) {
            return Ok(cached.clone());
        }

        debug!(pattern, "Minting leaf certificate");
        let leaf_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![pattern.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, pattern);
        let leaf = params.signed_by(&leaf_key, &self.issuer)?;

        let chain = vec![leaf.der().clone(), self.ca_der.clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let config = ServerConfig::builder_with_protocol_versions(&self.versions)
            .with_no_client_auth()
            .with_single_cert(chain, key)?;

        let config = Arc::new(config);
        self.cache.insert(pattern.to_string(), config.clone());
        Ok(config)
    }

    /// Build a server configuration from operator-supplied PEM material,
    /// used in place of minting when an endpoint configures one.
    pub fn from_pem(
        &self,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<Arc<ServerConfig>, CertError> {
        let chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(CertError::Pem)?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(CertError::Pem)?
            .ok_or_else(|| {
                CertError::Pem(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "no private key found in PEM",
                ))
            })?;
        let config = ServerConfig::builder_with_protocol_versions(&self.versions)
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        Ok(Arc::new(config))
    }
}

fn protocol_versions(
    names: &[String],
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, CertError> {
    let mut versions = Vec::new();
    for name in names {
        match name.as_str() {
            "1.2" => versions.push(&rustls::version::TLS12),
            "1.3" => versions.push(&rustls::version::TLS13),
            other => return Err(CertError::UnsupportedProtocol(other.to_string())),
        }
    }
    if versions.is_empty() {
        versions.push(&rustls::version::TLS12);
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

/// The certificate name a tunnel host maps to: deep subdomains collapse
/// to a wildcard so `a.example.com` and `b.example.com` share a leaf;
/// two-label hosts and IP literals are used verbatim.
pub fn wildcard_pattern(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() >= 3 && labels.iter().all(|l| !l.is_empty()) {
        format!("*.{}", labels[1..].join("."))
    } else {
        host.to_string()
    }
}
