use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol parse error: {0}")]
    Parse(String),
}
