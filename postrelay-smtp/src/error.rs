use std::io;

use thiserror::Error;

/// Errors that end an SMTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    #[error("session timed out after {0} seconds")]
    Timeout(u64),

    #[error("shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Tls(#[from] TlsError),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("unable to load certificate {path}: {source}")]
    CertificateLoad {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to load key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    Handshake(#[from] io::Error),

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

impl SessionError {
    /// Graceful endings are not worth an error-level log line.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}
