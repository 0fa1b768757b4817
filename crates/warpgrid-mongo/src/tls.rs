//! TLS client configuration for secure sockets.
//!
//! Builds a `rustls` client configuration from the `ssl_*` server options:
//!
//! - `ssl_cert` / `ssl_key`: client certificate and key for mutual TLS.
//!   The key may be bundled in the certificate file.
//! - `ssl_verify`: validate the server certificate and its identity.
//! - `ssl_ca_cert`: trusted CA bundle; implies verification. Without a
//!   bundle, verification trusts the Mozilla root store.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::error::{Error, Result};
use crate::options::ServerOptions;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub verify: bool,
    pub ca_cert: Option<PathBuf>,
}

impl TlsOptions {
    /// TLS options for `options`, or `None` when TLS is off.
    pub fn from_options(options: &ServerOptions) -> Option<Self> {
        if !options.ssl_enabled() {
            return None;
        }
        Some(Self {
            cert: options.ssl_cert.clone(),
            key: options.ssl_key.clone(),
            verify: options.ssl_verify.unwrap_or(false),
            ca_cert: options.ssl_ca_cert.clone(),
        })
    }

    /// Whether the peer certificate must be validated. A CA bundle implies
    /// validation.
    pub fn verifying_certificate(&self) -> bool {
        self.verify || self.ca_cert.is_some()
    }
}

/// A built TLS client context shared by every secure socket of a server.
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    verify: bool,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    pub fn new(options: &TlsOptions) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verify = options.verifying_certificate();

        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("tls protocol version error: {e}")))?;

        let builder = if verify {
            let mut roots = RootCertStore::empty();
            match &options.ca_cert {
                Some(path) => {
                    for cert in load_certs(path)? {
                        roots.add(cert).map_err(|e| {
                            Error::Tls(format!("invalid CA certificate in {}: {e}", path.display()))
                        })?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier::new(provider)))
        };

        let config = match &options.cert {
            Some(cert_path) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(options.key.as_deref().unwrap_or(cert_path))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::Tls(format!("invalid client certificate: {e}")))?
            }
            None => builder.with_no_client_auth(),
        };

        debug!(
            verify,
            client_cert = options.cert.is_some(),
            ca_bundle = options.ca_cert.is_some(),
            "built tls client context"
        );

        Ok(Self {
            config: Arc::new(config),
            verify,
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    pub fn verifying_certificate(&self) -> bool {
        self.verify
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Tls(format!("failed to read certificate file {}: {e}", path.display()))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse PEM file {}: {e}", path.display())))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("failed to read key file {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("failed to parse PEM file {}: {e}", path.display())))?
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

// ── Verifier used when ssl_verify is off ─────────────────────────────

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate. Handshake signatures are still
    /// checked so the session keys belong to the presented certificate.
    #[derive(Debug)]
    pub struct NoVerifier {
        provider: Arc<CryptoProvider>,
    }

    impl NoVerifier {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self { provider }
        }
    }

    impl ServerCertVerifier for NoVerifier {
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
}


#[cfg(test)]
mod tests {
    use super::testing::TestPki;
    use super::*;

    #[test]
    fn tls_off_without_ssl_options() {
        assert_eq!(TlsOptions::from_options(&ServerOptions::default()), None);
    }

    #[test]
    fn ca_bundle_implies_verification() {
        let options = ServerOptions {
            ssl_ca_cert: Some(PathBuf::from("ca.pem")),
            ..Default::default()
        };
        let tls = TlsOptions::from_options(&options).unwrap();
        assert!(!tls.verify);
        assert!(tls.verifying_certificate());
    }

    #[test]
    fn verify_flag_alone_enables_verification() {
        let tls = TlsOptions {
            verify: true,
            ..Default::default()
        };
        assert!(tls.verifying_certificate());
        assert!(!TlsOptions::default().verifying_certificate());
    }

    #[test]
    fn context_without_verification() {
        let ctx = TlsContext::new(&TlsOptions::default()).unwrap();
        assert!(!ctx.verifying_certificate());
    }

    #[test]
    fn context_with_system_roots() {
        let ctx = TlsContext::new(&TlsOptions {
            verify: true,
            ..Default::default()
        })
        .unwrap();
        assert!(ctx.verifying_certificate());
    }

    #[test]
    fn context_with_ca_bundle_and_client_cert() {
        let pki = TestPki::new();
        let client = pki.leaf("client", &["client.warp.local"]);

        let ctx = TlsContext::new(&TlsOptions {
            cert: Some(client.cert_path.clone()),
            key: Some(client.key_path.clone()),
            verify: false,
            ca_cert: Some(pki.ca_path.clone()),
        })
        .unwrap();
        assert!(ctx.verifying_certificate());
    }

    #[test]
    fn key_bundled_with_certificate() {
        let pki = TestPki::new();
        let client = pki.leaf("client", &["client.warp.local"]);
        let bundle = pki.dir.path().join("bundle.pem");
        let mut pem = std::fs::read_to_string(&client.cert_path).unwrap();
        pem.push_str(&std::fs::read_to_string(&client.key_path).unwrap());
        std::fs::write(&bundle, pem).unwrap();

        let ctx = TlsContext::new(&TlsOptions {
            cert: Some(bundle),
            ..Default::default()
        });
        assert!(ctx.is_ok());
    }

    #[test]
    fn missing_certificate_file_is_tls_error() {
        let err = TlsContext::new(&TlsOptions {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn certificate_without_key_is_tls_error() {
        let pki = TestPki::new();
        let client = pki.leaf("client", &["client.warp.local"]);
        let err = TlsContext::new(&TlsOptions {
            cert: Some(client.cert_path.clone()),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }
}
