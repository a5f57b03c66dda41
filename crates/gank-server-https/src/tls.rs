//! TLS material for the HTTPS front-end

use crate::HttpsServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// PEM-encoded certificate chain, private key and optional CA bundle
#[derive(Clone)]
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub ca_pem: Option<Vec<u8>>,
}

impl TlsMaterial {
    pub fn from_files(
        cert: &Path,
        key: &Path,
        ca: Option<&Path>,
    ) -> Result<Self, HttpsServerError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                HttpsServerError::TlsError(format!("Failed to read {}: {}", path.display(), e))
            })
        };
        Ok(Self {
            cert_pem: read(cert)?,
            key_pem: read(key)?,
            ca_pem: ca.map(read).transpose()?,
        })
    }

    /// Load certificates from PEM. CA certificates follow the leaf chain.
    fn load_certs(&self) -> Result<Vec<CertificateDer<'static>>, HttpsServerError> {
        let mut certs = parse_certs(&self.cert_pem)?;
        if let Some(ca) = &self.ca_pem {
            certs.extend(parse_certs(ca)?);
        }
        if certs.is_empty() {
            return Err(HttpsServerError::TlsError(
                "No certificates found".to_string(),
            ));
        }
        Ok(certs)
    }

    /// Load private key from PEM
    fn load_private_key(&self) -> Result<PrivateKeyDer<'static>, HttpsServerError> {
        let mut reader = BufReader::new(self.key_pem.as_slice());
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| HttpsServerError::TlsError(format!("Failed to parse key: {}", e)))?
            .ok_or_else(|| HttpsServerError::TlsError("No private key found".to_string()))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, HttpsServerError> {
        let certs = self.load_certs()?;
        let key = self.load_private_key()?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| HttpsServerError::TlsError(format!("Invalid TLS setup: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| HttpsServerError::TlsError(format!("Invalid cert/key: {}", e)))?;
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, HttpsServerError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HttpsServerError::TlsError(format!("Failed to parse certs: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_material_is_rejected() {
        let material = TlsMaterial {
            cert_pem: b"not a certificate".to_vec(),
            key_pem: b"not a key".to_vec(),
            ca_pem: None,
        };
        assert!(matches!(
            material.acceptor(),
            Err(HttpsServerError::TlsError(_))
        ));
    }

    #[test]
    fn test_missing_files() {
        let result = TlsMaterial::from_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            None,
        );
        assert!(matches!(result, Err(HttpsServerError::TlsError(_))));
    }
}
