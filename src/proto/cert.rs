//! Self-signed certificate generation for TLS mode.
//!
//! Produces a PEM certificate/key pair that [`super::tls::load_server_config`]
//! accepts, so a server can run with TLS enabled without an external CA.

use std::path::Path;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair};
use tracing::{debug, info};

/// A PEM-encoded certificate and its private key.
#[derive(Debug, Clone)]
pub struct PemPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl PemPair {
    /// Write the pair to the given paths, replacing existing files.
    pub fn write(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        std::fs::write(cert_path, &self.cert_pem)
            .with_context(|| format!("failed to write certificate: {}", cert_path.display()))?;
        std::fs::write(key_path, &self.key_pem)
            .with_context(|| format!("failed to write private key: {}", key_path.display()))?;
        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "wrote self-signed TLS key pair"
        );
        Ok(())
    }
}

/// Generate a self-signed certificate valid for the given subject names.
pub fn generate_self_signed(names: &[String]) -> Result<PemPair> {
    let key_pair = KeyPair::generate().context("failed to generate key pair")?;

    let mut params =
        CertificateParams::new(names.to_vec()).context("failed to create certificate params")?;
    if let Some(first) = names.first() {
        params
            .distinguished_name
            .push(DnType::CommonName, first.clone());
    }

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    debug!(names = ?names, "self-signed certificate generated");

    Ok(PemPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}
