use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::TlsError;

/// Server-side TLS material.
#[derive(Debug, Clone)]
pub struct TlsContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// The session transport: cleartext, or TLS after STARTTLS / an implicit
/// handshake on the smtps port.
pub enum Connection<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    Plain { stream: Stream },
    Tls { stream: Box<TlsStream<Stream>> },
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Connection<Stream> {
    pub fn plain(stream: Stream) -> Self {
        Self::Plain { stream }
    }

    /// Write one reply line; CRLF is appended here.
    pub(crate) async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut buffer = String::with_capacity(line.len() + 2);
        buffer.push_str(line);
        buffer.push_str("\r\n");

        match self {
            Self::Plain { stream } => stream.write_all(buffer.as_bytes()).await,
            Self::Tls { stream } => stream.write_all(buffer.as_bytes()).await,
        }
    }

    pub(crate) async fn receive(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain { stream } => stream.read(buf).await,
            Self::Tls { stream } => stream.read(buf).await,
        }
    }

    fn load_certs(path: &PathBuf) -> std::io::Result<Vec<CertificateDer<'static>>> {
        rustls_pemfile::certs(&mut BufReader::new(File::open(path)?)).collect()
    }

    fn load_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>, TlsError> {
        let path_str = path.display().to_string();
        let mut reader = BufReader::new(File::open(path).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path_str.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path: path_str,
                reason: "unrecognized key format (expected PKCS1, PKCS8, or SEC1)".to_string(),
            }),
        }
    }

    fn acceptor(tls_context: &TlsContext) -> Result<TlsAcceptor, TlsError> {
        let certs =
            Self::load_certs(&tls_context.certificate).map_err(|e| TlsError::CertificateLoad {
                path: tls_context.certificate.display().to_string(),
                source: e,
            })?;
        let key = Self::load_key(&tls_context.key)?;

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Upgrade a cleartext connection in place after STARTTLS.
    ///
    /// # Errors
    /// Returns an error if the material cannot be loaded or the handshake
    /// fails. An already upgraded connection is a protocol bug upstream and
    /// fails the handshake path as well.
    pub(crate) async fn upgrade(self, tls_context: &TlsContext) -> Result<Self, TlsError> {
        let acceptor = Self::acceptor(tls_context)?;

        match self {
            Self::Plain { stream } => {
                let stream = acceptor.accept(stream).await?;
                Ok(Self::Tls {
                    stream: Box::new(stream),
                })
            }
            Self::Tls { .. } => Err(TlsError::KeyLoad {
                path: tls_context.certificate.display().to_string(),
                reason: "connection is already TLS".to_string(),
            }),
        }
    }

    /// Wrap a fresh socket in TLS immediately, for the implicit-TLS port.
    ///
    /// # Errors
    /// Returns an error if the material cannot be loaded or the handshake
    /// fails.
    pub(crate) async fn accept_implicit(
        stream: Stream,
        tls_context: &TlsContext,
    ) -> Result<Self, TlsError> {
        let acceptor = Self::acceptor(tls_context)?;
        let stream = acceptor.accept(stream).await?;
        Ok(Self::Tls {
            stream: Box::new(stream),
        })
    }
}
