//! Error types shared by the store, the certificate authority and the proxies

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by [`MappingStore`](crate::mappings::MappingStore) mutations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Mapping not found: {0}")]
    NotFound(String),

    #[error("Invalid mapping: {0}")]
    Invalid(String),
}

/// Errors raised while creating, loading or issuing certificates
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("Invalid certificate material in {path}: {reason}")]
    InvalidMaterial { path: PathBuf, reason: String },

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Issuance task failed: {0}")]
    Task(String),
}

impl CertificateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidMaterial {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Failures while forwarding a request upstream
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend is not listening, timed out or dropped the connection
    #[error("upstream 127.0.0.1:{port} not reachable: {reason}")]
    Unreachable { port: u16, reason: String },

    #[error("proxy failure: {0}")]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}
