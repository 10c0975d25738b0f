//! TLS configuration for the QUIC underlay
//!
//! Generates a self-signed certificate via rcgen and a client config that
//! skips verification. Peers authenticate each other with the node token at
//! the signaling layer, not with certificates; TLS here provides transport
//! encryption between the two punched endpoints only.

use std::sync::Arc;

use crate::{NetworkError, Result};

/// Generated TLS certificate and key pair
pub struct TlsIdentity {
    /// DER-encoded certificate
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    /// DER-encoded private key
    pub key_der: rustls::pki_types::PrivatePkcs8KeyDer<'static>,
}

/// Generate a self-signed TLS certificate for localhost.
pub fn generate_self_signed() -> Result<TlsIdentity> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| NetworkError::Tls(format!("cert generation failed: {}", e)))?;

    let cert_der = rustls::pki_types::CertificateDer::from(cert.cert);
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    Ok(TlsIdentity { cert_der, key_der })
}

/// Build a quinn ServerConfig from a TLS identity.
pub fn quinn_server_config(identity: &TlsIdentity) -> Result<quinn::ServerConfig> {
    quinn::ServerConfig::with_single_cert(
        vec![identity.cert_der.clone()],
        identity.key_der.clone_key().into(),
    )
    .map_err(|e| NetworkError::Tls(format!("quinn server config failed: {}", e)))
}

/// Build a quinn ClientConfig that accepts any server certificate.
pub fn quinn_client_config() -> Result<quinn::ClientConfig> {
    let crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    Ok(quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| NetworkError::Tls(format!("quinn client config failed: {}", e)))?,
    )))
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed() {
        let identity = generate_self_signed().unwrap();
        assert!(!identity.cert_der.is_empty());
    }

    #[test]
    fn test_quinn_server_config() {
        let identity = generate_self_signed().unwrap();
        assert!(quinn_server_config(&identity).is_ok());
    }

    #[test]
    fn test_quinn_client_config() {
        assert!(quinn_client_config().is_ok());
    }
}
