//! TLS configuration, certificate loading and ALPN.
//!
//! # Responsibilities
//! - Load a PEM certificate chain and private key
//! - Build a rustls acceptor advertising the configured ALPN protocols
//! - Expose what the handshake negotiated as a [`TlsSession`]

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_rustls::rustls::server::ServerConnection;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// Error type for TLS setup.
#[derive(Debug)]
pub enum TlsError {
    /// Certificate or key file could not be read.
    Io(PathBuf, std::io::Error),
    /// The key file holds no private key.
    MissingKey(PathBuf),
    /// The certificate file holds no certificate.
    MissingCertificate(PathBuf),
    /// rustls rejected the configuration.
    Rustls(rustls::Error),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(path, e) => write!(f, "Failed to read {}: {}", path.display(), e),
            TlsError::MissingKey(path) => write!(f, "No private key found in {}", path.display()),
            TlsError::MissingCertificate(path) => {
                write!(f, "No certificate found in {}", path.display())
            }
            TlsError::Rustls(e) => write!(f, "Invalid TLS configuration: {}", e),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io(_, e) => Some(e),
            TlsError::Rustls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rustls::Error> for TlsError {
    fn from(e: rustls::Error) -> Self {
        TlsError::Rustls(e)
    }
}

/// Outcome of a completed TLS handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSession {
    alpn_protocol: Option<Vec<u8>>,
    server_name: Option<String>,
}

impl TlsSession {
    /// Session that negotiated `protocol` via ALPN (or nothing, for `None`).
    pub fn new(alpn_protocol: Option<&[u8]>) -> Self {
        Self {
            alpn_protocol: alpn_protocol.map(<[u8]>::to_vec),
            server_name: None,
        }
    }

    pub fn from_connection(connection: &ServerConnection) -> Self {
        Self {
            alpn_protocol: connection.alpn_protocol().map(<[u8]>::to_vec),
            server_name: connection.server_name().map(str::to_string),
        }
    }

    /// Protocol selected during the handshake, if the client offered ALPN.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    /// SNI host name sent by the client.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }
}

/// Build a TLS acceptor from PEM files.
pub fn load_tls_acceptor(
    cert_path: &Path,
    key_path: &Path,
    alpn_protocols: &[String],
) -> Result<TlsAcceptor, TlsError> {
    let certs = {
        let mut reader = open(cert_path)?;
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::Io(cert_path.to_path_buf(), e))?
    };
    if certs.is_empty() {
        return Err(TlsError::MissingCertificate(cert_path.to_path_buf()));
    }

    let key = {
        let mut reader = open(key_path)?;
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| TlsError::Io(key_path.to_path_buf(), e))?
            .ok_or_else(|| TlsError::MissingKey(key_path.to_path_buf()))?
    };

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn_protocols.iter().map(|p| p.as_bytes().to_vec()).collect();

    tracing::info!(
        cert = %cert_path.display(),
        alpn = ?alpn_protocols,
        "TLS configuration loaded"
    );
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Io(path.to_path_buf(), e))
}
