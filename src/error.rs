use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds of the data plane.
///
/// Handshake errors close the affected connection only; crypto open
/// failures are always fatal for the connection; config and registry
/// errors at startup are fatal for the process.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed header, wrong version, unexpected length
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Bad ATYP, unknown scheme, unknown AEAD method, unsupported command
    #[error("{0}")]
    Unsupported(String),

    /// Unknown credential
    #[error("auth failed: {0}")]
    Auth(String),

    /// AEAD open failure
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Socket errors
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Unparseable URL or JSON
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}
