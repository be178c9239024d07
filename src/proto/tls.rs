//! TLS configuration for benchmark connections.
//!
//! The client trusts any server certificate: TLS here exercises the
//! encrypted data path, it is not an authentication layer. The server loads a
//! certificate/key pair from PEM files.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, Error, ServerConfig, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tracing::debug;

/// ALPN protocol identifier offered by both ends.
const ALPN_LINKBENCH: &[u8] = b"linkbench/1";

/// SNI used when the dialed host is not a valid DNS name or IP literal.
const FALLBACK_SERVER_NAME: &str = "localhost";

// ---------------------------------------------------------------------------
// Client-side: custom ServerCertVerifier
// ---------------------------------------------------------------------------

/// A permissive server certificate verifier that accepts any certificate.
///
/// Handshake signatures are still checked so the session keys are bound to
/// the presented certificate; only the chain of trust is skipped.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Build a `rustls::ServerConfig` from a certificate chain and private key.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let provider = Arc::new(default_provider());

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to configure server certificate")?;

    config.alpn_protocols = vec![ALPN_LINKBENCH.to_vec()];

    Ok(config)
}

/// Load a PEM certificate chain and private key and build the server config.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let certs = CertificateDer::pem_file_iter(cert_path)
        .with_context(|| format!("failed to open certificate file: {}", cert_path.display()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificate file: {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in {}", cert_path.display());
    }

    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("failed to load private key: {}", key_path.display()))?;

    debug!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        chain_len = certs.len(),
        "loaded TLS key pair"
    );

    build_server_config(certs, key)
}

/// Build a `rustls::ClientConfig` that accepts any server certificate.
pub fn build_client_config() -> Result<ClientConfig> {
    let provider = Arc::new(default_provider());
    let verifier = Arc::new(AcceptAnyServerCert::new(provider.clone()));

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    config.alpn_protocols = vec![ALPN_LINKBENCH.to_vec()];

    Ok(config)
}

/// Derive the SNI name for a dialed host (no port, no brackets).
pub fn server_name(host: &str) -> ServerName<'static> {
    ServerName::try_from(host.to_string())
        .or_else(|_| ServerName::try_from(FALLBACK_SERVER_NAME.to_string()))
        .unwrap_or_else(|_| ServerName::IpAddress(std::net::Ipv4Addr::LOCALHOST.into()))
}
