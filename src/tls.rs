use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::stream::Deadline;

/// Source of the server's certificate chain and private key.
pub trait CertificateProvider {
    fn certified_key(&self) -> Result<(Vec<Certificate>, PrivateKey)>;
}

/// Reads a PEM certificate chain and a PEM private key from disk.
#[derive(Debug, Clone)]
pub struct PemFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl PemFiles {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

impl CertificateProvider for PemFiles {
    fn certified_key(&self) -> Result<(Vec<Certificate>, PrivateKey)> {
        let cert_file = File::open(&self.cert_path)
            .with_context(|| format!("Failed to open certificate: {:?}", self.cert_path))?;
        let chain: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .with_context(|| format!("Failed to parse certificate: {:?}", self.cert_path))?
            .into_iter()
            .map(Certificate)
            .collect();
        if chain.is_empty() {
            return Err(anyhow!("No certificate found in {:?}", self.cert_path));
        }

        let key_file = File::open(&self.key_path)
            .with_context(|| format!("Failed to open private key: {:?}", self.key_path))?;
        let key = rustls_pemfile::read_all(&mut BufReader::new(key_file))
            .with_context(|| format!("Failed to parse private key: {:?}", self.key_path))?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => Some(PrivateKey(der)),
                _ => None,
            })
            .ok_or_else(|| anyhow!("No private key found in {:?}", self.key_path))?;

        Ok((chain, key))
    }
}

/// Builds the process-wide server context: TLS 1.3 only, no client auth.
pub fn server_config(provider: &dyn CertificateProvider) -> Result<Arc<ServerConfig>> {
    let (chain, key) = provider.certified_key()?;
    let config = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| anyhow!("Failed to select TLS protocol versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;
    Ok(Arc::new(config))
}

/// A failed handshake. The raw connection is handed back so the caller can
/// still report the failure in plain text.
pub struct HandshakeError<S> {
    pub error: io::Error,
    pub stream: S,
}

impl<S> HandshakeError<S> {
    /// True when the handshake was cut off by its deadline.
    pub fn timed_out(&self) -> bool {
        self.error.kind() == io::ErrorKind::TimedOut
    }
}

impl<S> fmt::Debug for HandshakeError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<S> fmt::Display for HandshakeError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TLS handshake failed: {}", self.error)
    }
}

/// Upgrades plain connections to server-side TLS. Cheap to clone.
#[derive(Clone)]
pub struct TlsUpgrader {
    acceptor: TlsAcceptor,
}

impl TlsUpgrader {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }

    pub fn from_provider(provider: &dyn CertificateProvider) -> Result<Self> {
        Ok(Self::new(server_config(provider)?))
    }

    /// Runs a single server handshake on `stream`, failing with `TimedOut`
    /// if it has not finished within `deadline`. The deadline no longer
    /// applies once the handshake succeeds.
    pub async fn upgrade<S>(
        &self,
        stream: S,
        deadline: Option<Duration>,
    ) -> Result<TlsStream<Deadline<S>>, HandshakeError<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut tls = self
            .acceptor
            .accept(Deadline::new(stream, deadline))
            .into_fallible()
            .await
            .map_err(|(error, stream)| HandshakeError {
                error,
                stream: stream.into_inner(),
            })?;
        tls.get_mut().0.disarm();
        Ok(tls)
    }
}
