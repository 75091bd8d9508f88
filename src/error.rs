//! Error types for the proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error on either leg of a session
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Key generation or certificate self-signing failed
  #[error("crypto initialization failed: {0}")]
  CryptoInit(String),

  /// Signing a leaf certificate with the CA key failed
  #[error("certificate signing failed: {0}")]
  CryptoSign(String),

  /// Host name not usable in a certificate
  #[error("bad host: {0}")]
  BadHost(String),

  /// TLS handshake failure on either leg
  #[error("TLS handshake failed: {0}")]
  TlsHandshake(String),

  /// Origin TCP connection could not be established
  #[error("upstream dial failed: {0}")]
  UpstreamDial(String),

  /// Origin produced unusable bytes or dropped mid-message
  #[error("upstream IO error: {0}")]
  UpstreamIo(String),

  /// Malformed client HTTP
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Listener bind or other process-fatal startup failure
  #[error("startup failed: {0}")]
  Startup(String),
}

impl Error {
  /// Create a crypto initialization error and log it
  pub fn crypto_init(msg: impl Into<String>) -> Self {
    let error = Error::CryptoInit(msg.into());
    tracing::error!("Crypto init error: {}", error);
    error
  }

  /// Create a certificate signing error and log it
  pub fn crypto_sign(msg: impl Into<String>) -> Self {
    let error = Error::CryptoSign(msg.into());
    tracing::error!("Crypto sign error: {}", error);
    error
  }

  /// Create a bad host error and log it
  pub fn bad_host(msg: impl Into<String>) -> Self {
    let error = Error::BadHost(msg.into());
    tracing::error!("Bad host: {}", error);
    error
  }

  /// Create a TLS handshake error and log it
  pub fn tls_handshake(msg: impl Into<String>) -> Self {
    let error = Error::TlsHandshake(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create an upstream dial error and log it
  pub fn upstream_dial(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamDial(msg.into());
    tracing::error!("Upstream dial error: {}", error);
    error
  }

  /// Create an upstream IO error and log it
  pub fn upstream_io(msg: impl Into<String>) -> Self {
    let error = Error::UpstreamIo(msg.into());
    tracing::error!("Upstream IO error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("Invalid request: {}", error);
    error
  }

  /// Create a startup error and log it
  pub fn startup(msg: impl Into<String>) -> Self {
    let error = Error::Startup(msg.into());
    tracing::error!("Startup error: {}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}
