//! TLS over TCP.
//!
//! Certificates and keys are read from PEM files. The rustls `ring` provider
//! is selected explicitly so no process-wide default has to be installed.

use crate::tcp::TcpAcceptor;
use crate::transport::{Acceptor, BoxedDuplex, TransportError, TransportResult};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default bound on the TLS handshake of one connection
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS listener wrapping a [`TcpAcceptor`]
pub struct TlsAcceptor {
    inner: TcpAcceptor,
    tls: tokio_rustls::TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsAcceptor {
    /// Load `cert_path` (certificate chain) and `key_path` (private key)
    ///
    /// # Errors
    /// Returns [`TransportError::Io`] if a file cannot be read and
    /// [`TransportError::InvalidConfig`] / [`TransportError::Tls`] if the PEM
    /// contents are unusable.
    pub fn from_files(inner: TcpAcceptor, cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Self::from_pem(inner, &cert_pem, &key_pem)
    }

    /// Build from in-memory PEM data
    ///
    /// # Errors
    /// Returns [`TransportError::InvalidConfig`] if no certificate or key is
    /// found and [`TransportError::Tls`] if rustls rejects them.
    pub fn from_pem(inner: TcpAcceptor, cert_pem: &[u8], key_pem: &[u8]) -> TransportResult<Self> {
        let certs = load_certs(cert_pem)?;
        let key = load_key(key_pem)?;
        let config = server_config(certs, key)?;
        Ok(Self {
            inner,
            tls: tokio_rustls::TlsAcceptor::from(config),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    /// Override the per-connection handshake bound
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

fn load_certs(pem: &[u8]) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::InvalidConfig("no certificate in PEM".into()));
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> TransportResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| TransportError::InvalidConfig("no private key in PEM".into()))
}

fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> TransportResult<Arc<rustls::ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

#[async_trait]
impl Acceptor for TlsAcceptor {
    async fn accept(&self) -> TransportResult<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    async fn upgrade(&self, stream: TcpStream) -> TransportResult<BoxedDuplex> {
        let peer = stream.peer_addr().ok();
        let tls = tokio::time::timeout(self.handshake_timeout, self.tls.accept(stream))
            .await
            .map_err(|_| TransportError::Tls("handshake timed out".into()))?
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!("TLS handshake complete with {:?}", peer);
        Ok(Box::new(tls))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.local_addr()
    }

    fn scheme(&self) -> &'static str {
        "tls"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportConfig;
    use std::io::Write;

    fn acceptor() -> TcpAcceptor {
        TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), &TransportConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_empty_pem_rejected() {
        let result = TlsAcceptor::from_pem(acceptor(), b"", b"");
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TlsAcceptor::from_files(
            acceptor(),
            &dir.path().join("cert.pem"),
            &dir.path().join("key.pem"),
        );
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_garbage_pem_rejected() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"not a certificate").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"not a key").unwrap();

        let result = TlsAcceptor::from_files(acceptor(), cert.path(), key.path());
        assert!(matches!(result, Err(TransportError::InvalidConfig(_))));
    }
}
