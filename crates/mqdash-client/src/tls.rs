//! rustls session setup for broker connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::warn;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::config::TlsConfig;
use crate::error::{ClientError, Result};

/// Start a TLS session towards `host`, or the configured SNI override.
pub(crate) fn connect(config: &TlsConfig, host: &str) -> Result<ClientConnection> {
    let name = config.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::Tls(format!("'{}' is not a valid TLS server name", name)))?;

    let session = ClientConnection::new(Arc::new(client_config(config)?), server_name)
        .map_err(|e| ClientError::Tls(e.to_string()))?;
    Ok(session)
}

fn client_config(config: &TlsConfig) -> Result<ClientConfig> {
    let builder = ClientConfig::builder();

    if config.accept_invalid_certs {
        warn!("Broker certificate verification is disabled");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(insecure::AcceptAnyCert::new()))
            .with_no_client_auth());
    }

    let roots = match &config.ca_cert {
        Some(path) => roots_from_pem(path)?,
        None => RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        },
    };

    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Trust exactly the certificates in a PEM bundle.
fn roots_from_pem(path: &Path) -> Result<RootCertStore> {
    let tls_err = |what: &str, e: &dyn std::fmt::Display| {
        ClientError::Tls(format!("{} {}: {}", what, path.display(), e))
    };

    let file = File::open(path).map_err(|e| tls_err("cannot open CA bundle", &e))?;
    let mut roots = RootCertStore::empty();
    let mut found = 0usize;

    for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| tls_err("bad certificate in", &e))?;
        roots
            .add(cert)
            .map_err(|e| tls_err("unusable certificate in", &e))?;
        found += 1;
    }

    if found == 0 {
        return Err(ClientError::Tls(format!(
            "CA bundle {} holds no certificates",
            path.display()
        )));
    }
    Ok(roots)
}

/// For brokers with self-signed certificates in test setups.
mod insecure {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{ring, WebPkiSupportedAlgorithms};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Skips chain and hostname checks. Handshake signatures are still
    /// verified, so the peer must hold the key of the certificate it shows.
    #[derive(Debug)]
    pub struct AcceptAnyCert {
        algorithms: WebPkiSupportedAlgorithms,
    }

    impl AcceptAnyCert {
        pub fn new() -> Self {
            Self {
                algorithms: ring::default_provider().signature_verification_algorithms,
            }
        }
    }

    impl ServerCertVerifier for AcceptAnyCert {
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
            rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_default_roots() {
        assert!(connect(&TlsConfig::default(), "broker.example.com").is_ok());
    }

    #[test]
    fn test_insecure_config() {
        let config = TlsConfig {
            accept_invalid_certs: true,
            ..Default::default()
        };
        assert!(connect(&config, "localhost").is_ok());
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsConfig {
            server_name: Some("mqtt.internal".to_string()),
            ..Default::default()
        };
        assert!(connect(&config, "10.0.0.5").is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            connect(&config, "localhost"),
            Err(ClientError::Tls(_))
        ));
    }

    #[test]
    fn test_empty_ca_bundle() {
        let path = std::env::temp_dir().join(format!("mqdash-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();
        let config = TlsConfig {
            ca_cert: Some(path.clone()),
            ..Default::default()
        };
        let result = connect(&config, "localhost");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(result, Err(ClientError::Tls(_))));
    }

    #[test]
    fn test_invalid_server_name() {
        assert!(matches!(
            connect(&TlsConfig::default(), "not a hostname"),
            Err(ClientError::Tls(_))
        ));
    }
}
