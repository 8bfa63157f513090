//! TLS configuration: upstream client connectors and the optional listener
//! certificate.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig};
use tokio_rustls::TlsConnector;

/// ALPN offer for an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    /// Pooled multiplexed sessions.
    H2,
    /// Direct connections and WebSocket tunnels.
    Http1,
    /// Support probing: let the server choose.
    Negotiate,
}

impl Alpn {
    fn protocols(self) -> Vec<Vec<u8>> {
        match self {
            Alpn::H2 => vec![b"h2".to_vec()],
            Alpn::Http1 => vec![b"http/1.1".to_vec()],
            Alpn::Negotiate => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        }
    }
}

/// Prebuilt client configurations for every (verification, ALPN) pair.
#[derive(Clone)]
pub struct UpstreamTls {
    verified: [Arc<ClientConfig>; 3],
    insecure: [Arc<ClientConfig>; 3],
}

impl UpstreamTls {
    pub fn new() -> Result<Self, rustls::Error> {
        let provider = Arc::new(ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let roots = Arc::new(roots);

        let build = |alpn: Alpn, verify: bool| -> Result<Arc<ClientConfig>, rustls::Error> {
            let builder = ClientConfig::builder_with_provider(provider.clone())
                .with_safe_default_protocol_versions()?;
            let mut config = if verify {
                builder
                    .with_root_certificates(roots.clone())
                    .with_no_client_auth()
            } else {
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier(provider.clone())))
                    .with_no_client_auth()
            };
            config.alpn_protocols = alpn.protocols();
            Ok(Arc::new(config))
        };

        Ok(Self {
            verified: [
                build(Alpn::H2, true)?,
                build(Alpn::Http1, true)?,
                build(Alpn::Negotiate, true)?,
            ],
            insecure: [
                build(Alpn::H2, false)?,
                build(Alpn::Http1, false)?,
                build(Alpn::Negotiate, false)?,
            ],
        })
    }

    /// Connector for a route's `secure` flag and the wanted ALPN offer.
    pub fn connector(&self, secure: bool, alpn: Alpn) -> TlsConnector {
        let index = match alpn {
            Alpn::H2 => 0,
            Alpn::Http1 => 1,
            Alpn::Negotiate => 2,
        };
        let config = if secure {
            &self.verified[index]
        } else {
            &self.insecure[index]
        };
        TlsConnector::from(config.clone())
    }
}

/// Accepts any certificate; used when a route sets `secure = false`.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Load the listener certificate and key.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = std::io::BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("No private key found in {:?}", key_path),
        )
    })?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .and_then(|b| b.with_no_client_auth().with_single_cert(certs, key))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    // Inbound side speaks HTTP/1.1 so WebSocket upgrades keep working.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_all_connectors() {
        let tls = UpstreamTls::new().unwrap();
        assert_eq!(tls.verified[0].alpn_protocols, vec![b"h2".to_vec()]);
        assert_eq!(tls.insecure[1].alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert_eq!(tls.verified[2].alpn_protocols.len(), 2);
    }

    #[tokio::test]
    async fn missing_certificate_is_not_found() {
        let err = load_tls_config(Path::new("/nope/cert.pem"), Path::new("/nope/key.pem"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
