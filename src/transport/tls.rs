//! rustls client configuration from [`TlsConfig`]

use crate::config::TlsConfig;
use crate::error::{ConnectionFailure, EngineError, EngineResult};
use rumqttc::tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    client::WebPkiServerVerifier,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

fn tls_error(message: impl Into<String>) -> EngineError {
    ConnectionFailure::Tls(message.into()).into()
}

/// Build the rustls configuration for a TLS session
pub fn build_tls_config(tls: &TlsConfig) -> EngineResult<ClientConfig> {
    let builder = if tls.skip_verify {
        warn!("TLS certificate verification disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification))
    } else {
        let ca_file = tls
            .ca_file
            .as_deref()
            .ok_or_else(|| tls_error("no CA file configured"))?;
        let roots = load_roots(ca_file)?;
        match &tls.server_name {
            Some(name) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(FixedNameVerifier::new(roots, name)?)),
            None => ClientConfig::builder().with_root_certificates(roots),
        }
    };

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_key(key_file)?)
            .map_err(|e| tls_error(format!("failed to configure client auth: {e}"))),
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn open(path: &Path) -> EngineResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| tls_error(format!("failed to open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> EngineResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> EngineResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| tls_error(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| tls_error(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> EngineResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
    }
    Ok(roots)
}

/// Verifies the server against a configured name instead of the dialed host
#[derive(Debug)]
struct FixedNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
    name: ServerName<'static>,
}

impl FixedNameVerifier {
    fn new(roots: RootCertStore, name: &str) -> EngineResult<Self> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| tls_error(format!("failed to build verifier: {e}")))?;
        let name = ServerName::try_from(name.to_string())
            .map_err(|_| tls_error(format!("invalid server name: {name}")))?;
        Ok(Self { inner, name })
    }
}

impl ServerCertVerifier for FixedNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

mod danger {
    use super::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use super::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use super::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate
    #[derive(Debug)]
    pub struct NoCertificateVerification;

    impl ServerCertVerifier for NoCertificateVerification {
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
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_skip_verify_needs_no_files() {
        let tls = TlsConfig {
            skip_verify: true,
            ..Default::default()
        };
        assert!(build_tls_config(&tls).is_ok());
    }

    #[test]
    fn test_missing_ca_file_is_tls_error() {
        let tls = TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        let error = build_tls_config(&tls).unwrap_err();
        assert!(matches!(
            error,
            EngineError::Connection(ConnectionFailure::Tls(_))
        ));
    }

    #[test]
    fn test_ca_file_without_certificates_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();

        let tls = TlsConfig {
            ca_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let error = build_tls_config(&tls).unwrap_err();
        assert!(error.to_string().contains("no certificates"));
    }
}
