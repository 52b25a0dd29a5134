//! TLS client setup with rustls.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::config::SslMode;
use super::error::{PgError, PgResult};

/// Run the TLS handshake on a socket whose SSLRequest was accepted.
pub(crate) async fn handshake(
    tcp: TcpStream,
    host: &str,
    mode: SslMode,
) -> PgResult<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(client_config(mode)?));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| PgError::Tls(format!("Invalid hostname for TLS: {}", host)))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| PgError::Tls(format!("TLS handshake failed: {}", e)))
}

fn client_config(mode: SslMode) -> PgResult<ClientConfig> {
    if mode == SslMode::VerifyFull {
        let certs = rustls_native_certs::load_native_certs();
        for err in &certs.errors {
            warn!(error = %err, "failed to load a native root certificate");
        }

        let mut root_cert_store = RootCertStore::empty();
        for cert in certs.certs {
            let _ = root_cert_store.add(cert);
        }
        if root_cert_store.is_empty() {
            return Err(PgError::Tls(
                "no trusted root certificates available for verify-full".to_string(),
            ));
        }

        return Ok(ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth());
    }

    // prefer/require: encrypt without authenticating the server
    Ok(ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth())
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_mode_builds_without_roots() {
        assert!(client_config(SslMode::Require).is_ok());
    }
}
