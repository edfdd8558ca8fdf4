//! Error types for the capture proxy

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for capture proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for capture proxy operations
///
/// Everything except [`Error::Export`] and the configuration variants is scoped
/// to a single client connection: the connection task logs it and exits, the
/// proxy keeps serving.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// rustls error
  #[error("TLS error: {0}")]
  Tls(#[from] tokio_rustls::rustls::Error),

  /// TLS negotiation with the client or the origin failed
  #[error("Handshake error: {0}")]
  Handshake(String),

  /// The CA could not sign a leaf certificate
  #[error("Certificate issuance error: {0}")]
  CertificateIssuance(String),

  /// The origin could not be reached
  #[error("Upstream connect error ({target}): {source}")]
  UpstreamConnect {
    /// host:port that was dialed
    target: String,
    /// underlying cause
    source: io::Error,
  },

  /// Header or body text could not be decoded
  #[error("Decode error: {0}")]
  Decode(String),

  /// A connection closed before the exchange was fully read
  #[error("Incomplete flow: {0}")]
  IncompleteFlow(String),

  /// Malformed proxy request or HTTP head
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// The capture file could not be written
  #[error("Export error ({}): {source}", path.display())]
  Export {
    /// output file
    path: PathBuf,
    /// underlying cause
    source: io::Error,
  },

  /// Invalid configuration value
  #[error("Config error: {0}")]
  Config(String),

  /// Configuration sources could not be merged
  #[error(transparent)]
  ConfigLoad(#[from] config::ConfigError),
}

impl Error {
  /// Create a handshake error and log it
  pub fn handshake(msg: impl Into<String>) -> Self {
    let error = Error::Handshake(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a certificate issuance error and log it
  pub fn certificate_issuance(msg: impl Into<String>) -> Self {
    let error = Error::CertificateIssuance(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an upstream connect error and log it
  pub fn upstream_connect(target: impl Into<String>, source: io::Error) -> Self {
    let error = Error::UpstreamConnect {
      target: target.into(),
      source,
    };
    tracing::warn!("{}", error);
    error
  }

  /// Create an incomplete flow error
  ///
  /// Dropped connections are routine, so this only logs at debug.
  pub fn incomplete_flow(msg: impl Into<String>) -> Self {
    let error = Error::IncompleteFlow(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a config error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an export error and log it
  pub fn export(path: impl Into<PathBuf>, source: io::Error) -> Self {
    let error = Error::Export {
      path: path.into(),
      source,
    };
    tracing::error!("{}", error);
    error
  }

  /// Whether the error is the routine end of a connection rather than a fault
  pub fn is_disconnect(&self) -> bool {
    match self {
      Error::IncompleteFlow(_) => true,
      Error::Io(e) => matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
          | io::ErrorKind::BrokenPipe
          | io::ErrorKind::UnexpectedEof
      ),
      _ => false,
    }
  }
}
